//! Append-only audit log. Events are never mutated after insert except
//! the `processed` flag, which flips exactly once; pruning removes only
//! processed rows past the retention horizon.

use std::collections::HashMap;

use rusqlite::Connection;
use serde_json::json;

use praxmail_core::error::MailError;
use praxmail_core::types::{Event, RowId, Timestamp};

use crate::db::storage;

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_raw: String = row.get(3)?;
    Ok(Event {
        id: row.get(0)?,
        event_type: row.get(1)?,
        source: row.get(2)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or_else(|_| json!({})),
        processed: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

/// Append one event. A missing `timestamp` field is stamped with `now`.
pub fn append(
    conn: &Connection,
    event_type: &str,
    source: &str,
    mut payload: serde_json::Value,
    now: Timestamp,
) -> Result<RowId, MailError> {
    if !payload.is_object() {
        payload = json!({ "value": payload });
    }
    if payload.get("timestamp").is_none() {
        payload["timestamp"] = json!(now);
    }
    let raw = serde_json::to_string(&payload).map_err(|e| MailError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO events (event_type, source, payload, processed, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        rusqlite::params![event_type, source, raw, now],
    )
    .map_err(storage)?;
    Ok(conn.last_insert_rowid())
}

/// All events whose payload references `email_id`, insertion order.
pub fn for_email(conn: &Connection, email_id: RowId) -> Result<Vec<Event>, MailError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, event_type, source, payload, processed, created_at
             FROM events
             WHERE json_extract(payload, '$.email_id') = ?1
             ORDER BY id ASC",
        )
        .map_err(storage)?;
    let rows = stmt
        .query_map([email_id], parse_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(rows)
}

/// Events of one type created within `[start, end)`.
pub fn in_window(
    conn: &Connection,
    event_type: &str,
    start: Timestamp,
    end: Timestamp,
) -> Result<Vec<Event>, MailError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, event_type, source, payload, processed, created_at
             FROM events
             WHERE event_type = ?1 AND created_at >= ?2 AND created_at < ?3
             ORDER BY id ASC",
        )
        .map_err(storage)?;
    let rows = stmt
        .query_map(rusqlite::params![event_type, start, end], parse_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(rows)
}

pub fn count_by_type(
    conn: &Connection,
    event_type: &str,
    start: Timestamp,
    end: Timestamp,
) -> Result<u64, MailError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM events
             WHERE event_type = ?1 AND created_at >= ?2 AND created_at < ?3",
            rusqlite::params![event_type, start, end],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(count as u64)
}

/// Flip `processed` to true. A second flip is a no-op.
pub fn mark_processed(conn: &Connection, id: RowId) -> Result<(), MailError> {
    conn.execute("UPDATE events SET processed = 1 WHERE id = ?1", [id])
        .map_err(storage)?;
    Ok(())
}

/// Delete processed events older than `retention_days` relative to `now`.
/// Unprocessed events are retained regardless of age.
pub fn prune(conn: &Connection, retention_days: i64, now: Timestamp) -> Result<usize, MailError> {
    let horizon = now - retention_days * 86_400;
    let deleted = conn
        .execute(
            "DELETE FROM events WHERE processed = 1 AND created_at < ?1",
            [horizon],
        )
        .map_err(storage)?;
    Ok(deleted)
}

/// Histogram of a string field across events of one type in a window.
/// Used for escalation reason/flag statistics.
pub fn payload_histogram(
    conn: &Connection,
    event_type: &str,
    field: &str,
    start: Timestamp,
    end: Timestamp,
) -> Result<HashMap<String, u64>, MailError> {
    let mut histogram = HashMap::new();
    for event in in_window(conn, event_type, start, end)? {
        match event.payload.get(field) {
            Some(serde_json::Value::String(s)) => {
                *histogram.entry(s.clone()).or_insert(0) += 1;
            }
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        *histogram.entry(s.to_string()).or_insert(0) += 1;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(histogram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn append_stamps_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .transaction(|tx| append(tx, "watchdog.tick", "watchdog", json!({"runs": 1}), 42))
            .unwrap();
        let events = store.with_conn(|c| in_window(c, "watchdog.tick", 0, 100)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].payload["timestamp"], json!(42));
        assert_eq!(events[0].payload["runs"], json!(1));
        assert!(!events[0].processed);
    }

    #[test]
    fn window_is_half_open() {
        let store = Store::open_in_memory().unwrap();
        store.transaction(|tx| append(tx, "t", "s", json!({}), 10)).unwrap();
        store.transaction(|tx| append(tx, "t", "s", json!({}), 20)).unwrap();
        assert_eq!(store.with_conn(|c| count_by_type(c, "t", 10, 20)).unwrap(), 1);
        assert_eq!(store.with_conn(|c| count_by_type(c, "t", 10, 21)).unwrap(), 2);
    }

    #[test]
    fn prune_spares_unprocessed_and_recent() {
        let store = Store::open_in_memory().unwrap();
        let old_processed = store
            .transaction(|tx| append(tx, "t", "s", json!({}), 0))
            .unwrap();
        store.transaction(|tx| append(tx, "t", "s", json!({}), 0)).unwrap(); // old, unprocessed
        store.transaction(|tx| append(tx, "t", "s", json!({}), 900_000)).unwrap();
        store.transaction(|tx| mark_processed(tx, old_processed)).unwrap();

        let now = 30 * 86_400 + 1_000;
        let deleted = store.transaction(|tx| prune(tx, 30, now)).unwrap();
        assert_eq!(deleted, 1, "only the old processed event is pruned");
    }

    #[test]
    fn histogram_counts_strings_and_arrays() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                append(tx, "ESCALATED", "guard", json!({"reason": "language"}), 1)?;
                append(tx, "ESCALATED", "guard", json!({"reason": "language"}), 2)?;
                append(
                    tx,
                    "ESCALATED",
                    "guard",
                    json!({"reason": "mixed_intent", "flags": ["MIXED_INTENT", "X"]}),
                    3,
                )
            })
            .unwrap();
        let reasons = store
            .with_conn(|c| payload_histogram(c, "ESCALATED", "reason", 0, 10))
            .unwrap();
        assert_eq!(reasons["language"], 2);
        assert_eq!(reasons["mixed_intent"], 1);
        let flags = store
            .with_conn(|c| payload_histogram(c, "ESCALATED", "flags", 0, 10))
            .unwrap();
        assert_eq!(flags["MIXED_INTENT"], 1);
    }
}
