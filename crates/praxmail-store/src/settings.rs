//! Typed settings registry with an in-memory TTL cache.
//!
//! Values live in the `settings` table as text (arrays as JSON). Reads go
//! through a per-key cache (TTL 60 s); every write persists first, then
//! invalidates the key, so a reader never observes a stale value after a
//! completed `set_*` call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use praxmail_core::constants::SETTINGS_CACHE_TTL_SECS;
use praxmail_core::error::MailError;
use praxmail_core::types::{GuardSettings, Timestamp};

use crate::db::{storage, Store};

/// Known setting keys.
pub mod keys {
    pub const AUTO_SEND_ENABLED: &str = "auto_send_enabled";
    pub const AUTO_SEND_CONFIDENCE_THRESHOLD: &str = "auto_send_confidence_threshold";
    pub const SCORE_GATE_THRESHOLD: &str = "score_gate_threshold";
    pub const WORKING_HOURS_START: &str = "working_hours_start";
    pub const WORKING_HOURS_END: &str = "working_hours_end";
    pub const WORKING_DAYS: &str = "working_days";
    pub const HOLD_EXPIRY_MINUTES: &str = "hold_expiry_minutes";
    pub const MAX_HOLDS_PER_EMAIL: &str = "max_holds_per_email";
    pub const REQUIRE_MANUAL_APPROVAL: &str = "require_manual_approval";
    pub const RETRY_DELAY_MINUTES: &str = "retry_delay_minutes";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const AUDIT_RETENTION_DAYS: &str = "audit_retention_days";
}

/// Every known key with its seeded default. `initialize_defaults` inserts
/// the missing ones; `reset` rewrites them all.
pub const DEFAULTS: &[(&str, &str)] = &[
    (keys::AUTO_SEND_ENABLED, "false"),
    (keys::AUTO_SEND_CONFIDENCE_THRESHOLD, "0.95"),
    (keys::SCORE_GATE_THRESHOLD, "0.8"),
    (keys::WORKING_HOURS_START, "08:00"),
    (keys::WORKING_HOURS_END, "18:00"),
    (keys::WORKING_DAYS, "[1,2,3,4,5]"),
    (keys::HOLD_EXPIRY_MINUTES, "30"),
    (keys::MAX_HOLDS_PER_EMAIL, "3"),
    (keys::REQUIRE_MANUAL_APPROVAL, "true"),
    (keys::RETRY_DELAY_MINUTES, "15"),
    (keys::MAX_RETRIES, "3"),
    (keys::AUDIT_RETENTION_DAYS, "90"),
];

struct CacheEntry {
    value: String,
    fetched_at: Instant,
}

pub struct SettingsRegistry {
    store: Arc<Store>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SettingsRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_ttl(store, Duration::from_secs(SETTINGS_CACHE_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<Store>, ttl: Duration) -> Self {
        Self { store, cache: Mutex::new(HashMap::new()), ttl }
    }

    // ── Raw access ───────────────────────────────────────────────────────────

    fn get_raw(&self, key: &str) -> Option<String> {
        {
            let cache = self.lock_cache();
            if let Some(entry) = cache.get(key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Some(entry.value.clone());
                }
            }
        }
        let fetched = self
            .store
            .with_conn(|conn| {
                match conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                    r.get::<_, String>(0)
                }) {
                    Ok(v) => Ok(Some(v)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(storage(e)),
                }
            })
            .ok()
            .flatten()?;
        self.lock_cache().insert(
            key.to_string(),
            CacheEntry { value: fetched.clone(), fetched_at: Instant::now() },
        );
        Some(fetched)
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), MailError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )
            .map_err(storage)?;
            Ok(())
        })?;
        // Invalidate before returning so no reader sees the old value.
        self.lock_cache().remove(key);
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── Typed getters (default on missing or unparsable) ─────────────────────

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_raw(key).as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    pub fn get_number(&self, key: &str, default: f64) -> f64 {
        self.get_raw(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_raw(key)
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or(default)
    }

    // ── Typed setters ────────────────────────────────────────────────────────

    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), MailError> {
        self.set_raw(key, if value { "true" } else { "false" })
    }

    pub fn set_number(&self, key: &str, value: f64) -> Result<(), MailError> {
        self.set_raw(key, &value.to_string())
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<(), MailError> {
        self.set_raw(key, value)
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MailError> {
        let raw = serde_json::to_string(value).map_err(|e| MailError::Serialization(e.to_string()))?;
        self.set_raw(key, &raw)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Insert any missing default key. Idempotent; existing values are
    /// never overwritten.
    pub fn initialize_defaults(&self) -> Result<(), MailError> {
        self.store.transaction(|tx| {
            for (key, value) in DEFAULTS {
                tx.execute(
                    "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                    rusqlite::params![key, value],
                )
                .map_err(storage)?;
            }
            Ok(())
        })
    }

    /// Rewrite every known key back to its default.
    pub fn reset(&self) -> Result<(), MailError> {
        self.store.transaction(|tx| {
            for (key, value) in DEFAULTS {
                tx.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )
                .map_err(storage)?;
            }
            Ok(())
        })?;
        self.clear_cache();
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    // ── Domain views ─────────────────────────────────────────────────────────

    /// Snapshot of the guard-relevant keys, read once per decision.
    pub fn guard_snapshot(&self) -> GuardSettings {
        GuardSettings {
            auto_send_enabled: self.get_bool(keys::AUTO_SEND_ENABLED, false),
            confidence_threshold: self.get_number(keys::AUTO_SEND_CONFIDENCE_THRESHOLD, 0.95),
            require_manual_approval: self.get_bool(keys::REQUIRE_MANUAL_APPROVAL, true),
        }
    }

    pub fn hold_expiry_minutes(&self) -> i64 {
        self.get_number(keys::HOLD_EXPIRY_MINUTES, 30.0) as i64
    }

    pub fn max_holds_per_email(&self) -> i64 {
        self.get_number(keys::MAX_HOLDS_PER_EMAIL, 3.0) as i64
    }

    pub fn retry_delay_minutes(&self) -> i64 {
        self.get_number(keys::RETRY_DELAY_MINUTES, 15.0) as i64
    }

    pub fn max_retries(&self) -> u32 {
        self.get_number(keys::MAX_RETRIES, 3.0) as u32
    }

    pub fn audit_retention_days(&self) -> i64 {
        self.get_number(keys::AUDIT_RETENTION_DAYS, 90.0) as i64
    }

    /// Whether `now` falls inside configured working hours on a working
    /// day (0 = Sunday … 6 = Saturday; start inclusive, end exclusive).
    pub fn within_working_hours(&self, now: Timestamp) -> bool {
        let Some(dt) = Utc.timestamp_opt(now, 0).single() else {
            return false;
        };
        let days: Vec<u32> = self.get_json(keys::WORKING_DAYS, vec![1, 2, 3, 4, 5]);
        if !days.contains(&dt.weekday().num_days_from_sunday()) {
            return false;
        }
        let start = parse_hhmm(&self.get_string(keys::WORKING_HOURS_START, "08:00")).unwrap_or(480);
        let end = parse_hhmm(&self.get_string(keys::WORKING_HOURS_END, "18:00")).unwrap_or(1080);
        let minute_of_day = dt.hour() * 60 + dt.minute();
        minute_of_day >= start && minute_of_day < end
    }
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}
