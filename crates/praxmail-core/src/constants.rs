//! ─── Praxmail core constants ────────────────────────────────────────────────
//!
//! Fixed operating parameters of the pipeline. Anything an operator may
//! change at runtime lives in the settings table instead (see
//! `praxmail-store::settings`).

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Upper bound on emails pulled per pipeline tick.
pub const MAX_EMAILS_PER_BATCH: usize = 10;

/// Source tag written into pipeline-emitted audit events.
pub const PIPELINE_SOURCE: &str = "pipeline";

// ── Calendar ─────────────────────────────────────────────────────────────────

/// Calendar consulted for appointment proposals.
pub const DEFAULT_CALENDAR_ID: &str = "primary";

/// How far ahead the runner searches for a proposable slot (days).
pub const APPOINTMENT_SEARCH_DAYS: i64 = 14;

// ── Watchdog ─────────────────────────────────────────────────────────────────

/// Watchdog cadence (seconds).
pub const WATCHDOG_INTERVAL_SECS: u64 = 60;

/// Source tag written into watchdog-emitted audit events.
pub const WATCHDOG_SOURCE: &str = "watchdog";

// ── Health probes ────────────────────────────────────────────────────────────

/// Deadline for every external health probe (seconds).
pub const PROBE_DEADLINE_SECS: u64 = 5;

// ── Settings cache ───────────────────────────────────────────────────────────

/// Per-key TTL for the in-memory settings cache (seconds).
pub const SETTINGS_CACHE_TTL_SECS: u64 = 60;

// ── Store ────────────────────────────────────────────────────────────────────

/// SQLite page-cache hint, in KiB (negative pragma form ≈ 64 MB).
pub const STORE_CACHE_KIB: i64 = 65_536;
