//! Slot protocol: FREE → HELD(expires_at, email_id) → CONFIRMED or back
//! to FREE on expiry.
//!
//! Every operation runs in a single store transaction; the store's
//! serialized writer makes hold a compare-and-set, so only one concurrent
//! caller can take a given slot. A hold at `expires_at <= now` is
//! logically released (I5): readers treat it as free, and `hold` may
//! materialize the release instead of waiting for the watchdog sweep.
//! Only the coordinator flips `is_available` or writes `reservation` (I4).

use std::sync::Arc;

use rusqlite::Connection;
use tracing::debug;

use praxmail_core::error::MailError;
use praxmail_core::types::{Reservation, RowId, Slot, SlotInput, Timestamp};
use praxmail_store::{storage, Store};

const COLUMNS: &str =
    "id, calendar_id, start_time, end_time, is_available, reservation, created_at, updated_at";

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Slot> {
    let reservation_raw: Option<String> = row.get(5)?;
    let reservation = match reservation_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };
    Ok(Slot {
        id: row.get(0)?,
        calendar_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        is_available: row.get::<_, i64>(4)? != 0,
        reservation,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn slot_by_id(conn: &Connection, id: RowId) -> Result<Slot, MailError> {
    conn.query_row(&format!("SELECT {COLUMNS} FROM calendar_slots WHERE id = ?1"), [id], parse_row)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MailError::SlotNotFound(id),
            other => storage(other),
        })
}

fn write_reservation(
    conn: &Connection,
    id: RowId,
    reservation: Option<&Reservation>,
    now: Timestamp,
) -> Result<(), MailError> {
    let raw = match reservation {
        Some(r) => {
            Some(serde_json::to_string(r).map_err(|e| MailError::Serialization(e.to_string()))?)
        }
        None => None,
    };
    conn.execute(
        "UPDATE calendar_slots SET is_available = ?2, reservation = ?3, updated_at = ?4
         WHERE id = ?1",
        rusqlite::params![id, reservation.is_none(), raw, now],
    )
    .map_err(storage)?;
    Ok(())
}

pub struct CalendarCoordinator {
    store: Arc<Store>,
}

impl CalendarCoordinator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Upsert a slot by `(calendar_id, start, end)`. A slot that is
    /// currently held or confirmed is left untouched.
    pub fn create_or_update_slot(
        &self,
        input: &SlotInput,
        now: Timestamp,
    ) -> Result<RowId, MailError> {
        self.store.transaction(|tx| upsert_slot(tx, input, now))
    }

    /// Available slots on `calendar_id` starting within `[from, to]`,
    /// ordered by start time.
    pub fn find_available(
        &self,
        calendar_id: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Slot>, MailError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM calendar_slots
                     WHERE calendar_id = ?1 AND is_available = 1
                       AND start_time >= ?2 AND start_time <= ?3
                     ORDER BY start_time ASC"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(rusqlite::params![calendar_id, from, to], parse_row)
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Compare-and-set FREE → HELD with `expires_at = now + ttl`.
    /// Returns true iff this caller took the slot. An expired stale hold
    /// counts as free and is replaced.
    pub fn hold(
        &self,
        slot_id: RowId,
        email_id: RowId,
        ttl_minutes: i64,
        now: Timestamp,
    ) -> Result<bool, MailError> {
        self.store.transaction(|tx| {
            let slot = slot_by_id(tx, slot_id)?;
            let takeable = slot.is_available
                || slot.reservation.as_ref().is_some_and(|r| r.is_expired(now));
            if !takeable {
                return Ok(false);
            }
            let hold = Reservation::Hold { email_id, expires_at: now + ttl_minutes * 60 };
            write_reservation(tx, slot_id, Some(&hold), now)?;
            debug!(slot_id, email_id, "slot held");
            Ok(true)
        })
    }

    /// HELD → CONFIRMED, iff the current reservation is a live hold.
    /// Expired holds, free slots and already-confirmed slots return false.
    pub fn confirm(&self, slot_id: RowId, now: Timestamp) -> Result<bool, MailError> {
        self.store.transaction(|tx| {
            let slot = slot_by_id(tx, slot_id)?;
            let email_id = match slot.reservation {
                Some(ref r @ Reservation::Hold { email_id, .. }) if !r.is_expired(now) => email_id,
                _ => return Ok(false),
            };
            let confirmed = Reservation::Confirmed { email_id, confirmed_at: now };
            write_reservation(tx, slot_id, Some(&confirmed), now)?;
            debug!(slot_id, email_id, "hold confirmed");
            Ok(true)
        })
    }

    /// HELD → FREE for every hold at or past expiry. Returns the count
    /// released; confirmed slots are never touched. Idempotent.
    pub fn release_expired_holds(&self, now: Timestamp) -> Result<usize, MailError> {
        self.store.transaction(|tx| {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM calendar_slots
                     WHERE is_available = 0 AND reservation IS NOT NULL"
                ))
                .map_err(storage)?;
            let reserved = stmt
                .query_map([], parse_row)
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            drop(stmt);

            let mut released = 0usize;
            for slot in reserved {
                if slot.reservation.as_ref().is_some_and(|r| r.is_expired(now)) {
                    write_reservation(tx, slot.id, None, now)?;
                    released += 1;
                }
            }
            if released > 0 {
                debug!(released, "expired holds released");
            }
            Ok(released)
        })
    }

    /// Slots whose reservation references `email_id` (held or confirmed).
    pub fn slots_for_email(&self, email_id: RowId) -> Result<Vec<Slot>, MailError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM calendar_slots
                     WHERE json_extract(reservation, '$.email_id') = ?1
                     ORDER BY start_time ASC"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map([email_id], parse_row)
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Live (unexpired) holds referencing `email_id`; the pipeline checks
    /// this against the `max_holds_per_email` cap before holding again.
    pub fn count_active_holds_for_email(
        &self,
        email_id: RowId,
        now: Timestamp,
    ) -> Result<i64, MailError> {
        let slots = self.slots_for_email(email_id)?;
        Ok(slots
            .iter()
            .filter(|s| {
                matches!(&s.reservation, Some(r @ Reservation::Hold { .. }) if !r.is_expired(now))
            })
            .count() as i64)
    }

    /// Replace the FREE slots of `calendar_id` in the window covered by
    /// `slots` with the given set. Held and confirmed rows survive a sync.
    pub fn sync_slots(
        &self,
        calendar_id: &str,
        slots: &[SlotInput],
        now: Timestamp,
    ) -> Result<usize, MailError> {
        if slots.is_empty() {
            return Ok(0);
        }
        let window_start = slots.iter().map(|s| s.start_time).min().unwrap_or(0);
        let window_end = slots.iter().map(|s| s.end_time).max().unwrap_or(0);
        self.store.transaction(|tx| {
            tx.execute(
                "DELETE FROM calendar_slots
                 WHERE calendar_id = ?1 AND is_available = 1
                   AND start_time >= ?2 AND end_time <= ?3",
                rusqlite::params![calendar_id, window_start, window_end],
            )
            .map_err(storage)?;
            let mut upserted = 0usize;
            for input in slots {
                upsert_slot(tx, input, now)?;
                upserted += 1;
            }
            Ok(upserted)
        })
    }
}

fn upsert_slot(conn: &Connection, input: &SlotInput, now: Timestamp) -> Result<RowId, MailError> {
    // The conflict arm leaves reservation state alone: a sync never
    // disturbs a held or confirmed slot.
    conn.execute(
        "INSERT INTO calendar_slots
             (calendar_id, start_time, end_time, is_available, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?4)
         ON CONFLICT(calendar_id, start_time, end_time)
         DO UPDATE SET updated_at = excluded.updated_at",
        rusqlite::params![input.calendar_id, input.start_time, input.end_time, now],
    )
    .map_err(storage)?;
    let id = conn
        .query_row(
            "SELECT id FROM calendar_slots
             WHERE calendar_id = ?1 AND start_time = ?2 AND end_time = ?3",
            rusqlite::params![input.calendar_id, input.start_time, input.end_time],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(id)
}
