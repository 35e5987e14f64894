use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    // ── Ingest / idempotency ─────────────────────────────────────────────────
    #[error("duplicate message_id: {0}")]
    DuplicateMessage(String),

    #[error("duplicate content hash: {0}")]
    DuplicateContent(String),

    // ── State machine ────────────────────────────────────────────────────────
    #[error("forbidden state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown state value: {0}")]
    UnknownState(String),

    #[error("email not found: {0}")]
    EmailNotFound(i64),

    // ── Calendar ─────────────────────────────────────────────────────────────
    #[error("calendar slot not found: {0}")]
    SlotNotFound(i64),

    // ── Drafts / templates ───────────────────────────────────────────────────
    #[error("draft not found: {0}")]
    DraftNotFound(i64),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template render error: {0}")]
    Template(String),

    // ── External collaborators ───────────────────────────────────────────────
    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("mail send error: {0}")]
    Mailer(String),

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MailError {
    /// Stable kind tag used in audit payloads, so raw infrastructure
    /// messages never become load-bearing.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateMessage(_) | Self::DuplicateContent(_) => "duplicate",
            Self::InvalidTransition { .. } | Self::UnknownState(_) => "invariant",
            Self::EmailNotFound(_) | Self::SlotNotFound(_) | Self::DraftNotFound(_) => "not_found",
            Self::UnknownTemplate(_) | Self::Template(_) => "template",
            Self::Classifier(_) => "classifier",
            Self::Mailer(_) => "mailer",
            Self::Config(_) => "config",
            Self::Migration(_) | Self::Serialization(_) | Self::Storage(_) => "infrastructure",
        }
    }
}
