//! The decision pipeline: ingest dedup, classification, guard decision,
//! draft, send — one bounded state machine per email.

pub mod classify;
pub mod decider;
pub mod ingest;
pub mod locks;
pub mod mailer;
pub mod runner;

pub use classify::Classifier;
pub use decider::{Decider, DecisionOutcome, DecisionStats};
pub use ingest::{IngestFilter, IngestOutcome};
pub use mailer::{Mailer, SendOutcome};
pub use runner::{PipelineRunner, TickSummary};
