//! Audit event type names.
//!
//! The event log is the ground truth for state history; these constants
//! are the full vocabulary the core emits.

pub const EMAIL_RECEIVED: &str = "email.received";
pub const EMAIL_CLASSIFIED: &str = "email.classified";
pub const DRAFT_CREATED: &str = "draft.created";
pub const DRAFT_SENT: &str = "draft.sent";
pub const GUARD_APPROVED: &str = "GUARD_APPROVED";
pub const ESCALATED: &str = "ESCALATED";
pub const EMAIL_ESCALATED: &str = "EMAIL_ESCALATED";
pub const HOLDS_RELEASED: &str = "calendar.holds_released";
pub const HEALTH_CHECK_FAILED: &str = "health.check_failed";
pub const WATCHDOG_TICK: &str = "watchdog.tick";
pub const ERROR: &str = "error";
