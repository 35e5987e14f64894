//! Email repository. Row-level functions take a `&Connection` so callers
//! can compose them inside a [`crate::Store::transaction`] closure
//! (a `&rusqlite::Transaction` coerces via deref).

use rusqlite::Connection;
use serde_json::json;

use praxmail_core::error::MailError;
use praxmail_core::types::{Classification, Email, EmailState, NewEmail, RowId, Timestamp};

use crate::db::storage;
use crate::events;

const COLUMNS: &str = "id, message_id, account, from_addr, subject, body_text, received_at, \
                       text_hash, state, classification, confidence, flags, details, \
                       escalation_reason, created_at, updated_at";

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Email> {
    let state_raw: String = row.get(8)?;
    let flags_raw: String = row.get(11)?;
    let details_raw: String = row.get(12)?;
    Ok(Email {
        id: row.get(0)?,
        message_id: row.get(1)?,
        account: row.get(2)?,
        from_addr: row.get(3)?,
        subject: row.get(4)?,
        body_text: row.get(5)?,
        received_at: row.get(6)?,
        text_hash: row.get(7)?,
        state: EmailState::parse(&state_raw)
            .map_err(|e| conversion_err(8, e))?,
        classification: row.get(9)?,
        confidence: row.get(10)?,
        flags: serde_json::from_str(&flags_raw)
            .map_err(|e| conversion_err(11, MailError::Serialization(e.to_string())))?,
        details: serde_json::from_str(&details_raw)
            .map_err(|e| conversion_err(12, MailError::Serialization(e.to_string())))?,
        escalation_reason: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn conversion_err(idx: usize, e: MailError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Insert a fresh email in state INGESTED. Violating the `message_id` or
/// `text_hash` uniqueness aborts with a duplicate error (I1/I2); callers
/// that want a non-error duplicate outcome check first (idempotency filter).
pub fn insert(
    conn: &Connection,
    new: &NewEmail,
    text_hash: Option<&str>,
    now: Timestamp,
) -> Result<RowId, MailError> {
    conn.execute(
        "INSERT INTO emails (message_id, account, from_addr, subject, body_text, received_at,
                             text_hash, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        rusqlite::params![
            new.message_id,
            new.account,
            new.from_addr,
            new.subject,
            new.body_text,
            new.received_at,
            text_hash,
            EmailState::Ingested.as_str(),
            now,
        ],
    )
    .map_err(|e| {
        if let rusqlite::Error::SqliteFailure(f, Some(msg)) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                if msg.contains("message_id") {
                    return MailError::DuplicateMessage(new.message_id.clone());
                }
                if msg.contains("text_hash") {
                    return MailError::DuplicateContent(
                        text_hash.unwrap_or_default().to_string(),
                    );
                }
            }
        }
        storage(e)
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn by_id(conn: &Connection, id: RowId) -> Result<Email, MailError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM emails WHERE id = ?1"),
        [id],
        parse_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => MailError::EmailNotFound(id),
        other => storage(other),
    })
}

pub fn id_by_message_id(conn: &Connection, message_id: &str) -> Result<Option<RowId>, MailError> {
    match conn.query_row("SELECT id FROM emails WHERE message_id = ?1", [message_id], |r| {
        r.get(0)
    }) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

pub fn id_by_text_hash(conn: &Connection, text_hash: &str) -> Result<Option<RowId>, MailError> {
    match conn.query_row("SELECT id FROM emails WHERE text_hash = ?1", [text_hash], |r| {
        r.get(0)
    }) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

/// Emails in `state`, oldest first, capped at `limit`, skipping rows whose
/// retry delay (`details.next_retry_at`) has not elapsed.
pub fn in_state(
    conn: &Connection,
    state: EmailState,
    limit: usize,
    now: Timestamp,
) -> Result<Vec<Email>, MailError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COLUMNS} FROM emails
             WHERE state = ?1
               AND (json_extract(details, '$.next_retry_at') IS NULL
                    OR json_extract(details, '$.next_retry_at') <= ?2)
             ORDER BY id ASC
             LIMIT ?3"
        ))
        .map_err(storage)?;
    let rows = stmt
        .query_map(rusqlite::params![state.as_str(), now, limit as i64], parse_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(rows)
}

/// Persist the classifier output on the email row.
pub fn set_classification(
    conn: &Connection,
    id: RowId,
    classification: &Classification,
    now: Timestamp,
) -> Result<(), MailError> {
    let flags = serde_json::to_string(&classification.flags)
        .map_err(|e| MailError::Serialization(e.to_string()))?;
    let details = serde_json::to_string(&classification.details)
        .map_err(|e| MailError::Serialization(e.to_string()))?;
    let changed = conn
        .execute(
            "UPDATE emails
             SET classification = ?2, confidence = ?3, flags = ?4, details = ?5, updated_at = ?6
             WHERE id = ?1",
            rusqlite::params![id, classification.class, classification.confidence, flags, details, now],
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(MailError::EmailNotFound(id));
    }
    Ok(())
}

/// Overwrite the opaque `details` blob (attempt counters, retry stamps).
pub fn set_details(
    conn: &Connection,
    id: RowId,
    details: &serde_json::Value,
    now: Timestamp,
) -> Result<(), MailError> {
    let raw = serde_json::to_string(details).map_err(|e| MailError::Serialization(e.to_string()))?;
    let changed = conn
        .execute(
            "UPDATE emails SET details = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, raw, now],
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(MailError::EmailNotFound(id));
    }
    Ok(())
}

pub fn set_escalation_reason(
    conn: &Connection,
    id: RowId,
    reason: &str,
    now: Timestamp,
) -> Result<(), MailError> {
    let changed = conn
        .execute(
            "UPDATE emails SET escalation_reason = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, reason, now],
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(MailError::EmailNotFound(id));
    }
    Ok(())
}

/// Advance the email's state along an allowed edge and append the single
/// primary audit event for that transition, atomically with respect to the
/// surrounding transaction (I3 + I6).
pub fn transition(
    conn: &Connection,
    id: RowId,
    to: EmailState,
    event_type: &str,
    source: &str,
    mut payload: serde_json::Value,
    now: Timestamp,
) -> Result<(), MailError> {
    let current = by_id(conn, id)?.state;
    if !current.can_advance_to(to) {
        return Err(MailError::InvalidTransition {
            from: current.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    conn.execute(
        "UPDATE emails SET state = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![id, to.as_str(), now],
    )
    .map_err(storage)?;

    if !payload.is_object() {
        payload = json!({});
    }
    payload["email_id"] = json!(id);
    payload["from_state"] = json!(current.as_str());
    payload["to_state"] = json!(to.as_str());
    events::append(conn, event_type, source, payload, now)?;
    Ok(())
}
