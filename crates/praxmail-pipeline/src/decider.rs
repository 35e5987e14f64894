//! Decision orchestration: run the guard for one classified email,
//! persist the outcome as audit events and a state transition.
//!
//! Errors never fall through as auto-replies: any failure inside the
//! decision path degrades to an escalation with reason `guard_error`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use praxmail_core::error::MailError;
use praxmail_core::event;
use praxmail_core::types::{Decision, EmailContext, EmailState, RowId, Timestamp};
use praxmail_store::{emails, events, SettingsRegistry, Store};

const GUARD_SOURCE: &str = "guard";

/// What the pipeline acts on after a decision has been persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub should_auto_reply: bool,
    pub escalation_reason: Option<String>,
    pub escalation_flags: Vec<String>,
}

impl DecisionOutcome {
    fn approved() -> Self {
        Self { should_auto_reply: true, escalation_reason: None, escalation_flags: Vec::new() }
    }

    fn escalated(reason: &str, flags: Vec<String>) -> Self {
        Self {
            should_auto_reply: false,
            escalation_reason: Some(reason.to_string()),
            escalation_flags: flags,
        }
    }

    fn guard_error() -> Self {
        Self::escalated("guard_error", vec!["GUARD_ERROR".to_string()])
    }
}

/// Decision statistics over an event window `[start, end)`.
#[derive(Clone, Debug, Default)]
pub struct DecisionStats {
    pub total: u64,
    pub approved: u64,
    pub escalated: u64,
    pub approval_rate: f64,
    pub escalation_rate: f64,
    pub escalation_reasons: HashMap<String, u64>,
    pub escalation_flags: HashMap<String, u64>,
}

pub struct Decider {
    store: Arc<Store>,
    settings: Arc<SettingsRegistry>,
}

impl Decider {
    pub fn new(store: Arc<Store>, settings: Arc<SettingsRegistry>) -> Self {
        Self { store, settings }
    }

    /// Decide one email. Persists the outcome; infallible by design —
    /// see module docs.
    pub fn decide(&self, ctx: &EmailContext, now: Timestamp) -> DecisionOutcome {
        match self.try_decide(ctx, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(email_id = ctx.email_id, error = %e, "decision failed — escalating");
                if let Err(persist_err) = self.escalate(
                    ctx.email_id,
                    "guard_error",
                    &["GUARD_ERROR".to_string()],
                    now,
                ) {
                    // Last resort: at least leave an ESCALATED mark in the log.
                    warn!(email_id = ctx.email_id, error = %persist_err, "escalation write failed");
                    let _ = self.store.transaction(|tx| {
                        events::append(
                            tx,
                            event::ESCALATED,
                            GUARD_SOURCE,
                            json!({
                                "email_id": ctx.email_id,
                                "reason": "guard_error",
                                "error_kind": e.kind(),
                            }),
                            now,
                        )
                    });
                }
                DecisionOutcome::guard_error()
            }
        }
    }

    fn try_decide(&self, ctx: &EmailContext, now: Timestamp) -> Result<DecisionOutcome, MailError> {
        let snapshot = self.settings.guard_snapshot();
        let decision: Decision = praxmail_guard::evaluate(ctx, &snapshot);
        debug!(
            email_id = ctx.email_id,
            auto = decision.auto,
            reason = %decision.reason,
            "guard evaluated"
        );

        if decision.auto {
            self.store.transaction(|tx| {
                emails::transition(
                    tx,
                    ctx.email_id,
                    EmailState::Decided,
                    event::GUARD_APPROVED,
                    GUARD_SOURCE,
                    json!({
                        "reason": decision.reason,
                        "class": ctx.klass,
                        "confidence": ctx.confidence,
                    }),
                    now,
                )
            })?;
            Ok(DecisionOutcome::approved())
        } else {
            self.escalate(ctx.email_id, &decision.reason, &decision.escalate_flags, now)?;
            Ok(DecisionOutcome::escalated(&decision.reason, decision.escalate_flags))
        }
    }

    /// Route an email to a human: record the `ESCALATED`/`EMAIL_ESCALATED`
    /// event pair and land the row in state ESCALATED with its reason.
    /// Also used by the runner when an approved reply cannot be produced.
    pub fn escalate(
        &self,
        email_id: RowId,
        reason: &str,
        flags: &[String],
        now: Timestamp,
    ) -> Result<(), MailError> {
        self.store.transaction(|tx| {
            let payload = json!({ "reason": reason, "flags": flags });
            let state = emails::by_id(tx, email_id)?.state;
            if state == EmailState::Classified {
                emails::transition(
                    tx,
                    email_id,
                    EmailState::Decided,
                    event::ESCALATED,
                    GUARD_SOURCE,
                    payload.clone(),
                    now,
                )?;
            } else {
                // Already past DECIDED (e.g. a post-approval escalation):
                // the ESCALATED mark is a plain audit append.
                let mut p = payload.clone();
                p["email_id"] = json!(email_id);
                events::append(tx, event::ESCALATED, GUARD_SOURCE, p, now)?;
            }
            emails::transition(
                tx,
                email_id,
                EmailState::Escalated,
                event::EMAIL_ESCALATED,
                GUARD_SOURCE,
                payload,
                now,
            )?;
            emails::set_escalation_reason(tx, email_id, reason, now)
        })
    }

    /// Decide a batch concurrently; ordering is preserved only per email
    /// (each decision is independent).
    pub async fn decide_batch(
        self: &Arc<Self>,
        contexts: Vec<EmailContext>,
        now: Timestamp,
    ) -> Vec<DecisionOutcome> {
        let tasks: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                let decider = Arc::clone(self);
                tokio::task::spawn_blocking(move || decider.decide(&ctx, now))
            })
            .collect();
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(task.await.unwrap_or_else(|_| DecisionOutcome::guard_error()));
        }
        outcomes
    }

    /// Aggregate approval/escalation counts and reason/flag histograms
    /// from the audit log.
    pub fn stats(&self, start: Timestamp, end: Timestamp) -> Result<DecisionStats, MailError> {
        self.store.with_conn(|conn| {
            let approved = events::count_by_type(conn, event::GUARD_APPROVED, start, end)?;
            let escalated = events::count_by_type(conn, event::ESCALATED, start, end)?;
            let total = approved + escalated;
            let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
            Ok(DecisionStats {
                total,
                approved,
                escalated,
                approval_rate: rate(approved),
                escalation_rate: rate(escalated),
                escalation_reasons: events::payload_histogram(
                    conn,
                    event::ESCALATED,
                    "reason",
                    start,
                    end,
                )?,
                escalation_flags: events::payload_histogram(
                    conn,
                    event::ESCALATED,
                    "flags",
                    start,
                    end,
                )?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use praxmail_core::types::{Classification, NewEmail};
    use praxmail_store::settings::keys;

    fn setup() -> (Arc<Store>, Arc<SettingsRegistry>, Decider) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let settings = Arc::new(SettingsRegistry::new(Arc::clone(&store)));
        settings.initialize_defaults().unwrap();
        let decider = Decider::new(Arc::clone(&store), Arc::clone(&settings));
        (store, settings, decider)
    }

    fn classified_email(store: &Store, message_id: &str, class: &str, confidence: f64) -> RowId {
        store
            .transaction(|tx| {
                let id = emails::insert(
                    tx,
                    &NewEmail {
                        message_id: message_id.into(),
                        account: "a".into(),
                        from_addr: "f@example.de".into(),
                        subject: "s".into(),
                        body_text: "b".into(),
                        received_at: 0,
                    },
                    None,
                    0,
                )?;
                emails::set_classification(
                    tx,
                    id,
                    &Classification {
                        class: class.into(),
                        confidence,
                        flags: vec![],
                        details: json!({}),
                    },
                    0,
                )?;
                emails::transition(
                    tx,
                    id,
                    EmailState::Classified,
                    event::EMAIL_CLASSIFIED,
                    "test",
                    json!({}),
                    0,
                )?;
                Ok(id)
            })
            .unwrap()
    }

    fn ctx(email_id: RowId, class: &str, confidence: f64) -> EmailContext {
        EmailContext {
            email_id,
            klass: class.into(),
            confidence,
            flags: vec![],
            details: json!({}),
            kb_policy: None,
        }
    }

    #[test]
    fn approval_records_event_and_state() {
        let (store, settings, decider) = setup();
        settings.set_bool(keys::AUTO_SEND_ENABLED, true).unwrap();
        settings.set_bool(keys::REQUIRE_MANUAL_APPROVAL, false).unwrap();

        let id = classified_email(&store, "m1", "Termin", 0.98);
        let outcome = decider.decide(&ctx(id, "Termin", 0.98), 100);
        assert!(outcome.should_auto_reply);

        let email = store.with_conn(|c| emails::by_id(c, id)).unwrap();
        assert_eq!(email.state, EmailState::Decided);
        let log = store.with_conn(|c| events::for_email(c, id)).unwrap();
        assert!(log.iter().any(|e| e.event_type == event::GUARD_APPROVED));
    }

    #[test]
    fn prescription_escalates_with_event_pair() {
        let (store, _settings, decider) = setup();
        let id = classified_email(&store, "m1", "rezept_anfrage", 0.99);
        let outcome = decider.decide(&ctx(id, "rezept_anfrage", 0.99), 100);

        assert!(!outcome.should_auto_reply);
        assert_eq!(outcome.escalation_reason.as_deref(), Some("sensitive_rezept_anfrage"));
        assert_eq!(outcome.escalation_flags, vec!["SENSITIVE_CATEGORY"]);

        let email = store.with_conn(|c| emails::by_id(c, id)).unwrap();
        assert_eq!(email.state, EmailState::Escalated);
        assert_eq!(email.escalation_reason.as_deref(), Some("sensitive_rezept_anfrage"));

        let log = store.with_conn(|c| events::for_email(c, id)).unwrap();
        let escalated = log.iter().filter(|e| e.event_type == event::ESCALATED).count();
        let email_escalated =
            log.iter().filter(|e| e.event_type == event::EMAIL_ESCALATED).count();
        assert_eq!((escalated, email_escalated), (1, 1), "exactly one of each event");
    }

    #[test]
    fn decision_error_degrades_to_guard_error() {
        let (store, _settings, decider) = setup();
        // Email id 999 does not exist; the transition inside try_decide fails.
        let outcome = decider.decide(&ctx(999, "Termin", 0.99), 100);
        assert!(!outcome.should_auto_reply);
        assert_eq!(outcome.escalation_reason.as_deref(), Some("guard_error"));
        assert_eq!(outcome.escalation_flags, vec!["GUARD_ERROR"]);

        let marks = store
            .with_conn(|c| events::in_window(c, event::ESCALATED, 0, 1_000))
            .unwrap();
        assert_eq!(marks.len(), 1, "an ESCALATED mark is persisted even on failure");
    }

    #[tokio::test]
    async fn batch_decisions_are_independent() {
        let (store, settings, decider) = setup();
        settings.set_bool(keys::AUTO_SEND_ENABLED, true).unwrap();
        settings.set_bool(keys::REQUIRE_MANUAL_APPROVAL, false).unwrap();
        let decider = Arc::new(decider);

        let ok = classified_email(&store, "m1", "Termin", 0.99);
        let low = classified_email(&store, "m2", "Termin", 0.50);
        let outcomes = decider
            .decide_batch(vec![ctx(ok, "Termin", 0.99), ctx(low, "Termin", 0.50)], 100)
            .await;
        assert!(outcomes[0].should_auto_reply);
        assert!(!outcomes[1].should_auto_reply);
        assert_eq!(outcomes[1].escalation_reason.as_deref(), Some("low_confidence_0.50"));
    }

    #[test]
    fn stats_windows_and_histograms() {
        let (store, settings, decider) = setup();
        settings.set_bool(keys::AUTO_SEND_ENABLED, true).unwrap();
        settings.set_bool(keys::REQUIRE_MANUAL_APPROVAL, false).unwrap();

        let a = classified_email(&store, "m1", "Termin", 0.99);
        let b = classified_email(&store, "m2", "rezept_anfrage", 0.99);
        let c = classified_email(&store, "m3", "rezept_wiederholung", 0.99);
        decider.decide(&ctx(a, "Termin", 0.99), 100);
        decider.decide(&ctx(b, "rezept_anfrage", 0.99), 110);
        decider.decide(&ctx(c, "rezept_wiederholung", 0.99), 120);

        let stats = decider.stats(0, 1_000).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.escalated, 2);
        assert!((stats.escalation_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.escalation_reasons["sensitive_rezept_anfrage"], 1);
        assert_eq!(stats.escalation_flags["SENSITIVE_CATEGORY"], 2);

        // Window end is exclusive.
        let earlier = decider.stats(0, 120).unwrap();
        assert_eq!(earlier.total, 2);
    }
}
