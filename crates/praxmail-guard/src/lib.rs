//! Guard policy: the rule layer that decides auto-reply versus escalation.
//!
//! [`evaluate`] is a pure function of the email context and a settings
//! snapshot. It never touches the store; the decider owns persistence.

pub mod policy;

pub use policy::evaluate;
