//! Periodic housekeeping: health probes and calendar hold expiry, driven
//! by a single-flight timer loop.

pub mod health;
pub mod watchdog;

pub use health::{HealthMonitor, HealthReport, HealthStatus, ProbeResult};
pub use watchdog::Watchdog;
