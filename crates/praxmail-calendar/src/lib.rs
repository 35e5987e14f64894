//! Calendar slot coordination: availability, time-bounded holds,
//! confirmation and expiry release.

pub mod coordinator;

pub use coordinator::CalendarCoordinator;
