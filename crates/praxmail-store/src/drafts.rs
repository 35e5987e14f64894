//! Draft repository. A draft is the unit of idempotent send: its row id
//! doubles as the mail adapter's correlation id.

use rusqlite::Connection;

use praxmail_core::error::MailError;
use praxmail_core::types::{Draft, DraftStatus, RowId, Timestamp};

use crate::db::storage;

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Draft> {
    let status_raw: String = row.get(4)?;
    Ok(Draft {
        id: row.get(0)?,
        email_id: row.get(1)?,
        template_id: row.get(2)?,
        rendered_text: row.get(3)?,
        status: DraftStatus::parse(&status_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: row.get(5)?,
        sent_at: row.get(6)?,
    })
}

pub fn insert(
    conn: &Connection,
    email_id: RowId,
    template_id: &str,
    rendered_text: &str,
    now: Timestamp,
) -> Result<RowId, MailError> {
    conn.execute(
        "INSERT INTO drafts (email_id, template_id, rendered_text, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![email_id, template_id, rendered_text, DraftStatus::Created.as_str(), now],
    )
    .map_err(storage)?;
    Ok(conn.last_insert_rowid())
}

pub fn by_id(conn: &Connection, id: RowId) -> Result<Draft, MailError> {
    conn.query_row(
        "SELECT id, email_id, template_id, rendered_text, status, created_at, sent_at
         FROM drafts WHERE id = ?1",
        [id],
        parse_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => MailError::DraftNotFound(id),
        other => storage(other),
    })
}

pub fn for_email(conn: &Connection, email_id: RowId) -> Result<Vec<Draft>, MailError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, email_id, template_id, rendered_text, status, created_at, sent_at
             FROM drafts WHERE email_id = ?1 ORDER BY id ASC",
        )
        .map_err(storage)?;
    let rows = stmt
        .query_map([email_id], parse_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(rows)
}

pub fn mark_sent(conn: &Connection, id: RowId, now: Timestamp) -> Result<(), MailError> {
    set_status(conn, id, DraftStatus::Sent, Some(now))
}

pub fn mark_failed(conn: &Connection, id: RowId) -> Result<(), MailError> {
    set_status(conn, id, DraftStatus::Failed, None)
}

fn set_status(
    conn: &Connection,
    id: RowId,
    status: DraftStatus,
    sent_at: Option<Timestamp>,
) -> Result<(), MailError> {
    let changed = conn
        .execute(
            "UPDATE drafts SET status = ?2, sent_at = ?3 WHERE id = ?1",
            rusqlite::params![id, status.as_str(), sent_at],
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(MailError::DraftNotFound(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emails, Store};
    use praxmail_core::types::NewEmail;

    fn insert_email(store: &Store) -> RowId {
        store
            .transaction(|tx| {
                emails::insert(
                    tx,
                    &NewEmail {
                        message_id: "m1".into(),
                        account: "a".into(),
                        from_addr: "f".into(),
                        subject: "s".into(),
                        body_text: "b".into(),
                        received_at: 0,
                    },
                    None,
                    0,
                )
            })
            .unwrap()
    }

    #[test]
    fn draft_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let email_id = insert_email(&store);
        let draft_id = store
            .transaction(|tx| insert(tx, email_id, "termin_vorschlag", "Sehr geehrte…", 100))
            .unwrap();

        let draft = store.with_conn(|c| by_id(c, draft_id)).unwrap();
        assert_eq!(draft.status, DraftStatus::Created);
        assert!(draft.sent_at.is_none());

        store.transaction(|tx| mark_sent(tx, draft_id, 200)).unwrap();
        let draft = store.with_conn(|c| by_id(c, draft_id)).unwrap();
        assert_eq!(draft.status, DraftStatus::Sent);
        assert_eq!(draft.sent_at, Some(200));
    }

    #[test]
    fn draft_requires_existing_email() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .transaction(|tx| insert(tx, 999, "faq_antwort", "text", 0))
            .unwrap_err();
        assert!(matches!(err, MailError::Storage(_)), "FK violation surfaces as storage error");
    }
}
