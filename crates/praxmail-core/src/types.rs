use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MailError;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Row identifier for emails, events, slots and drafts (SQLite rowid).
pub type RowId = i64;

// ── Email state machine ──────────────────────────────────────────────────────

/// Lifecycle state of an inbound email.
///
/// Allowed edges:
///   INGESTED → CLASSIFIED → DECIDED → (DRAFTED → SENT) | ESCALATED
/// with FAILED reachable from every non-terminal state. SENT, ESCALATED
/// and FAILED are terminal; no reverse transitions exist.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailState {
    Ingested,
    Classified,
    Decided,
    Drafted,
    Sent,
    Escalated,
    Failed,
}

impl EmailState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "INGESTED",
            Self::Classified => "CLASSIFIED",
            Self::Decided => "DECIDED",
            Self::Drafted => "DRAFTED",
            Self::Sent => "SENT",
            Self::Escalated => "ESCALATED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, MailError> {
        match s {
            "INGESTED" => Ok(Self::Ingested),
            "CLASSIFIED" => Ok(Self::Classified),
            "DECIDED" => Ok(Self::Decided),
            "DRAFTED" => Ok(Self::Drafted),
            "SENT" => Ok(Self::Sent),
            "ESCALATED" => Ok(Self::Escalated),
            "FAILED" => Ok(Self::Failed),
            other => Err(MailError::UnknownState(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Escalated | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_advance_to(&self, next: EmailState) -> bool {
        if !self.is_terminal() && next == Self::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Self::Ingested, Self::Classified)
                | (Self::Classified, Self::Decided)
                | (Self::Decided, Self::Drafted)
                | (Self::Decided, Self::Escalated)
                | (Self::Drafted, Self::Sent)
        )
    }
}

impl fmt::Display for EmailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Emails ───────────────────────────────────────────────────────────────────

/// An inbound message as delivered by the mail ingestor (pre-dedup).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewEmail {
    pub message_id: String,
    pub account: String,
    pub from_addr: String,
    pub subject: String,
    pub body_text: String,
    pub received_at: Timestamp,
}

/// A tracked email row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Email {
    pub id: RowId,
    pub message_id: String,
    pub account: String,
    pub from_addr: String,
    pub subject: String,
    pub body_text: String,
    pub received_at: Timestamp,
    pub text_hash: Option<String>,
    pub state: EmailState,
    pub classification: Option<String>,
    pub confidence: Option<f64>,
    pub flags: Vec<String>,
    pub details: serde_json::Value,
    pub escalation_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Classification ───────────────────────────────────────────────────────────

/// Output contract of the (external) classifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Classification {
    pub class: String,
    pub confidence: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Class name assigned when the classifier returns something the core
/// does not recognize.
pub const UNCLEAR_INTENT: &str = "unclear_intent";

// ── Guard ────────────────────────────────────────────────────────────────────

/// Knowledge-base policy hints attached to a classified email.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KbPolicy {
    #[serde(default)]
    pub requires_doctor: bool,
    #[serde(default)]
    pub requires_privacy_check: bool,
    #[serde(default)]
    pub complexity_score: f64,
}

/// Everything the guard needs to know about one email.
#[derive(Clone, Debug)]
pub struct EmailContext {
    pub email_id: RowId,
    pub klass: String,
    pub confidence: f64,
    pub flags: Vec<String>,
    pub details: serde_json::Value,
    pub kb_policy: Option<KbPolicy>,
}

/// Settings snapshot the guard evaluates against. Read once per decision
/// so the policy stays a pure function.
#[derive(Clone, Copy, Debug)]
pub struct GuardSettings {
    pub auto_send_enabled: bool,
    pub confidence_threshold: f64,
    pub require_manual_approval: bool,
}

/// Guard verdict for one email.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub auto: bool,
    pub reason: String,
    pub escalate_flags: Vec<String>,
}

impl Decision {
    pub fn auto(reason: impl Into<String>) -> Self {
        Self { auto: true, reason: reason.into(), escalate_flags: Vec::new() }
    }

    pub fn escalate(reason: impl Into<String>, flags: &[&str]) -> Self {
        Self {
            auto: false,
            reason: reason.into(),
            escalate_flags: flags.iter().map(|f| (*f).to_string()).collect(),
        }
    }
}

// ── Calendar ─────────────────────────────────────────────────────────────────

/// Reservation attached to a non-available slot. Stored as a JSON blob in
/// the slot row; `email_id` is a lookup value, never a pointer back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reservation {
    Hold { email_id: RowId, expires_at: Timestamp },
    Confirmed { email_id: RowId, confirmed_at: Timestamp },
}

impl Reservation {
    pub fn email_id(&self) -> RowId {
        match self {
            Self::Hold { email_id, .. } | Self::Confirmed { email_id, .. } => *email_id,
        }
    }

    /// A hold at or past its expiry is logically released. Confirmed
    /// reservations never expire.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self {
            Self::Hold { expires_at, .. } => *expires_at <= now,
            Self::Confirmed { .. } => false,
        }
    }
}

/// One bookable slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Slot {
    pub id: RowId,
    pub calendar_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub is_available: bool,
    pub reservation: Option<Reservation>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Upsert input for a slot (key: calendar_id + start + end).
#[derive(Clone, Debug)]
pub struct SlotInput {
    pub calendar_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

// ── Drafts ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Created,
    Sent,
    Failed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, MailError> {
        match s {
            "created" => Ok(Self::Created),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(MailError::UnknownState(other.to_string())),
        }
    }
}

/// A rendered reply bound to an email; the unit of idempotent send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Draft {
    pub id: RowId,
    pub email_id: RowId,
    pub template_id: String,
    pub rendered_text: String,
    pub status: DraftStatus,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Append-only audit record. Never mutated after insert except the
/// `processed` flag, which flips exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: RowId,
    pub event_type: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_allowed() {
        use EmailState::*;
        assert!(Ingested.can_advance_to(Classified));
        assert!(Classified.can_advance_to(Decided));
        assert!(Decided.can_advance_to(Drafted));
        assert!(Decided.can_advance_to(Escalated));
        assert!(Drafted.can_advance_to(Sent));
    }

    #[test]
    fn reverse_and_skip_edges_forbidden() {
        use EmailState::*;
        assert!(!Classified.can_advance_to(Ingested));
        assert!(!Sent.can_advance_to(Drafted));
        assert!(!Ingested.can_advance_to(Decided));
        assert!(!Ingested.can_advance_to(Sent));
        assert!(!Escalated.can_advance_to(Decided));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        use EmailState::*;
        for s in [Ingested, Classified, Decided, Drafted] {
            assert!(s.can_advance_to(Failed), "{s} should be able to fail");
        }
        for s in [Sent, Escalated, Failed] {
            assert!(!s.can_advance_to(Failed), "{s} is terminal");
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        use EmailState::*;
        for s in [Ingested, Classified, Decided, Drafted, Sent, Escalated, Failed] {
            assert_eq!(EmailState::parse(s.as_str()).unwrap(), s);
        }
        assert!(EmailState::parse("PENDING").is_err());
    }

    #[test]
    fn reservation_json_shape() {
        let hold = Reservation::Hold { email_id: 7, expires_at: 1_700_000_000 };
        let json = serde_json::to_value(&hold).unwrap();
        assert_eq!(json["type"], "hold");
        assert_eq!(json["email_id"], 7);
        let back: Reservation = serde_json::from_value(json).unwrap();
        assert_eq!(back, hold);
    }

    #[test]
    fn hold_expired_at_exact_boundary() {
        let hold = Reservation::Hold { email_id: 1, expires_at: 100 };
        assert!(!hold.is_expired(99));
        assert!(hold.is_expired(100), "expires_at == now counts as expired");
        assert!(hold.is_expired(101));
        let confirmed = Reservation::Confirmed { email_id: 1, confirmed_at: 100 };
        assert!(!confirmed.is_expired(i64::MAX));
    }
}
