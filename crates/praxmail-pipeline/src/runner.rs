//! Pipeline runner: drives each email through its state machine, one
//! bounded batch per tick.
//!
//! Per tick: pull INGESTED rows (and DRAFTED rows due for a send retry),
//! process them concurrently — one task per email, serialized per email
//! id — and tally the outcomes. Failures of the classifier or the mail
//! adapter are retried with a delay; after `max_retries` the email lands
//! in FAILED. The runner pauses intake while the shared health flag says
//! the system is unhealthy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{info, warn};

use praxmail_calendar::CalendarCoordinator;
use praxmail_core::constants::{
    APPOINTMENT_SEARCH_DAYS, DEFAULT_CALENDAR_ID, MAX_EMAILS_PER_BATCH, PIPELINE_SOURCE,
};
use praxmail_core::error::MailError;
use praxmail_core::event;
use praxmail_core::types::{Email, EmailContext, EmailState, KbPolicy, RowId, Timestamp};
use praxmail_store::{drafts, emails, events, SettingsRegistry, Store};
use praxmail_templates::{TemplateEngine, FAQ_ANTWORT, TERMIN_VORSCHLAG};

use crate::classify::{is_appointment_class, sanitize, Classifier};
use crate::decider::Decider;
use crate::locks::EmailLocks;
use crate::mailer::Mailer;

/// Outcome tally for one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub processed: usize,
    pub sent: usize,
    pub escalated: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum ProcessOutcome {
    Sent,
    Escalated,
    Retried,
    Failed,
    Skipped,
}

struct RunnerInner {
    store: Arc<Store>,
    settings: Arc<SettingsRegistry>,
    classifier: Arc<dyn Classifier>,
    mailer: Arc<dyn Mailer>,
    templates: Arc<dyn TemplateEngine>,
    calendar: Arc<CalendarCoordinator>,
    decider: Arc<Decider>,
    locks: EmailLocks,
    healthy: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<RunnerInner>,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        settings: Arc<SettingsRegistry>,
        classifier: Arc<dyn Classifier>,
        mailer: Arc<dyn Mailer>,
        templates: Arc<dyn TemplateEngine>,
        calendar: Arc<CalendarCoordinator>,
        healthy: Arc<AtomicBool>,
    ) -> Self {
        let decider = Arc::new(Decider::new(Arc::clone(&store), Arc::clone(&settings)));
        Self {
            inner: Arc::new(RunnerInner {
                store,
                settings,
                classifier,
                mailer,
                templates,
                calendar,
                decider,
                locks: EmailLocks::default(),
                healthy,
            }),
        }
    }

    /// Run the pipeline on a fixed cadence until the shutdown signal flips.
    pub async fn run(self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.processed > 0 => {
                            info!(
                                processed = summary.processed,
                                sent = summary.sent,
                                escalated = summary.escalated,
                                retried = summary.retried,
                                failed = summary.failed,
                                "pipeline tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "pipeline tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("pipeline runner stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<TickSummary, MailError> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// One pipeline pass at an explicit instant (tests drive the clock).
    pub async fn tick_at(&self, now: Timestamp) -> Result<TickSummary, MailError> {
        if !self.inner.healthy.load(Ordering::Relaxed) {
            warn!("system unhealthy — pipeline tick skipped");
            return Ok(TickSummary::default());
        }

        let inner = &self.inner;
        let fresh = inner
            .store
            .with_conn(|c| emails::in_state(c, EmailState::Ingested, MAX_EMAILS_PER_BATCH, now))?;
        let resend = inner
            .store
            .with_conn(|c| emails::in_state(c, EmailState::Drafted, MAX_EMAILS_PER_BATCH, now))?;

        // A batch of zero is a legal no-op tick.
        if fresh.is_empty() && resend.is_empty() {
            return Ok(TickSummary::default());
        }

        let mut tasks = Vec::new();
        for email in fresh {
            let runner = self.clone();
            tasks.push(tokio::spawn(async move { runner.process_new(email, now).await }));
        }
        for email in resend {
            let runner = self.clone();
            tasks.push(tokio::spawn(async move { runner.retry_send(email, now).await }));
        }

        let mut summary = TickSummary::default();
        for task in tasks {
            match task.await {
                Ok(Ok(outcome)) => {
                    summary.processed += 1;
                    match outcome {
                        ProcessOutcome::Sent => summary.sent += 1,
                        ProcessOutcome::Escalated => summary.escalated += 1,
                        ProcessOutcome::Retried => summary.retried += 1,
                        ProcessOutcome::Failed => summary.failed += 1,
                        ProcessOutcome::Skipped => {
                            summary.processed -= 1;
                            summary.skipped += 1;
                        }
                    }
                }
                Ok(Err(e)) => {
                    summary.processed += 1;
                    summary.failed += 1;
                    warn!(error = %e, "email processing error");
                }
                Err(join_err) => {
                    summary.failed += 1;
                    warn!(error = %join_err, "email task panicked");
                }
            }
        }
        self.inner.locks.prune();
        Ok(summary)
    }

    // ── Per-email flow ───────────────────────────────────────────────────────

    async fn process_new(&self, email: Email, now: Timestamp) -> Result<ProcessOutcome, MailError> {
        let inner = &self.inner;
        let _guard = inner.locks.acquire(email.id).await;

        // Reload under the lock; another task may have advanced it.
        let email = inner.store.with_conn(|c| emails::by_id(c, email.id))?;
        if email.state != EmailState::Ingested {
            return Ok(ProcessOutcome::Skipped);
        }

        // 1. Classify.
        let text = crate::ingest::normalize_body(&email.body_text);
        let classification = match inner.classifier.classify(&text).await {
            Ok(c) => sanitize(c),
            Err(e) => return self.record_failure(&email, "classifier", &e, now),
        };
        inner.store.transaction(|tx| {
            emails::set_classification(tx, email.id, &classification, now)?;
            emails::transition(
                tx,
                email.id,
                EmailState::Classified,
                event::EMAIL_CLASSIFIED,
                PIPELINE_SOURCE,
                json!({
                    "class": classification.class,
                    "confidence": classification.confidence,
                }),
                now,
            )
        })?;

        // 2. Decide.
        let ctx = EmailContext {
            email_id: email.id,
            klass: classification.class.clone(),
            confidence: classification.confidence,
            flags: classification.flags.clone(),
            details: classification.details.clone(),
            kb_policy: classification
                .details
                .get("kb_policy")
                .and_then(|v| serde_json::from_value::<KbPolicy>(v.clone()).ok()),
        };
        let outcome = inner.decider.decide(&ctx, now);
        if !outcome.should_auto_reply {
            return Ok(ProcessOutcome::Escalated);
        }

        // 3. Prepare the reply (may hold a calendar slot).
        let Some((template_id, vars)) = self.prepare_reply(&email, &ctx, now)? else {
            inner.decider.escalate(
                email.id,
                "no_slots_available",
                &["NO_SLOTS_AVAILABLE".to_string()],
                now,
            )?;
            return Ok(ProcessOutcome::Escalated);
        };
        let rendered = match inner.templates.render(template_id, &vars) {
            Ok(text) => text,
            Err(e) => {
                // Rendering failures are permanent; never auto-reply blind.
                warn!(email_id = email.id, error = %e, "template render failed");
                inner.decider.escalate(
                    email.id,
                    "template_error",
                    &["TEMPLATE_ERROR".to_string()],
                    now,
                )?;
                return Ok(ProcessOutcome::Escalated);
            }
        };

        // 4. Draft, then send.
        let draft_id = inner.store.transaction(|tx| {
            let draft_id = drafts::insert(tx, email.id, template_id, &rendered, now)?;
            emails::transition(
                tx,
                email.id,
                EmailState::Drafted,
                event::DRAFT_CREATED,
                PIPELINE_SOURCE,
                json!({ "draft_id": draft_id, "template_id": template_id }),
                now,
            )?;
            Ok(draft_id)
        })?;
        self.send_draft(&email, draft_id, &rendered, now).await
    }

    /// Resend path for DRAFTED emails whose previous send failed.
    async fn retry_send(&self, email: Email, now: Timestamp) -> Result<ProcessOutcome, MailError> {
        let inner = &self.inner;
        let _guard = inner.locks.acquire(email.id).await;

        let email = inner.store.with_conn(|c| emails::by_id(c, email.id))?;
        if email.state != EmailState::Drafted {
            return Ok(ProcessOutcome::Skipped);
        }
        let pending = inner
            .store
            .with_conn(|c| drafts::for_email(c, email.id))?
            .into_iter()
            .rev()
            .find(|d| d.status != praxmail_core::types::DraftStatus::Sent);
        let Some(draft) = pending else {
            return Ok(ProcessOutcome::Skipped);
        };
        let rendered = draft.rendered_text.clone();
        self.send_draft(&email, draft.id, &rendered, now).await
    }

    async fn send_draft(
        &self,
        email: &Email,
        draft_id: RowId,
        rendered: &str,
        now: Timestamp,
    ) -> Result<ProcessOutcome, MailError> {
        let inner = &self.inner;
        let subject = format!("Re: {}", email.subject);
        match inner.mailer.send(&email.from_addr, &subject, rendered, draft_id).await {
            Ok(sent) => {
                inner.store.transaction(|tx| {
                    drafts::mark_sent(tx, draft_id, now)?;
                    emails::transition(
                        tx,
                        email.id,
                        EmailState::Sent,
                        event::DRAFT_SENT,
                        PIPELINE_SOURCE,
                        json!({ "draft_id": draft_id, "provider_id": sent.provider_id }),
                        now,
                    )
                })?;
                Ok(ProcessOutcome::Sent)
            }
            Err(e) => {
                inner.store.transaction(|tx| drafts::mark_failed(tx, draft_id))?;
                let email = inner.store.with_conn(|c| emails::by_id(c, email.id))?;
                self.record_failure(&email, "send", &e, now)
            }
        }
    }

    /// Pick a template and its variables. Appointment requests reserve a
    /// slot first; `None` means no slot could be held and the email must
    /// go to a human.
    fn prepare_reply(
        &self,
        email: &Email,
        ctx: &EmailContext,
        now: Timestamp,
    ) -> Result<Option<(&'static str, serde_json::Value)>, MailError> {
        let inner = &self.inner;
        if !is_appointment_class(&ctx.klass) {
            let answer = ctx
                .details
                .get("suggested_answer")
                .and_then(|v| v.as_str())
                .unwrap_or("Wir haben Ihre Anfrage erhalten und kümmern uns darum.")
                .to_string();
            return Ok(Some((FAQ_ANTWORT, json!({ "answer": answer }))));
        }

        // Reuse an existing live hold (a retried email keeps its slot).
        let held = inner
            .calendar
            .slots_for_email(email.id)?
            .into_iter()
            .find(|s| s.reservation.as_ref().is_some_and(|r| !r.is_expired(now)));
        let slot = match held {
            Some(slot) => Some(slot),
            None => self.hold_next_free_slot(email.id, now)?,
        };
        let Some(slot) = slot else {
            return Ok(None);
        };
        Ok(Some((
            TERMIN_VORSCHLAG,
            json!({
                "slot_start": format_instant(slot.start_time),
                "slot_end": format_instant(slot.end_time),
            }),
        )))
    }

    fn hold_next_free_slot(
        &self,
        email_id: RowId,
        now: Timestamp,
    ) -> Result<Option<praxmail_core::types::Slot>, MailError> {
        let inner = &self.inner;
        if inner.calendar.count_active_holds_for_email(email_id, now)?
            >= inner.settings.max_holds_per_email()
        {
            return Ok(None);
        }
        let ttl = inner.settings.hold_expiry_minutes();
        let horizon = now + APPOINTMENT_SEARCH_DAYS * 86_400;
        for slot in inner.calendar.find_available(DEFAULT_CALENDAR_ID, now, horizon)? {
            if inner.calendar.hold(slot.id, email_id, ttl, now)? {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Record a retryable failure: `error` event, attempt counter bump,
    /// retry delay — or the FAILED transition once retries are exhausted.
    fn record_failure(
        &self,
        email: &Email,
        stage: &str,
        error: &MailError,
        now: Timestamp,
    ) -> Result<ProcessOutcome, MailError> {
        let inner = &self.inner;
        let attempts = email.details.get("attempts").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        let max_retries = inner.settings.max_retries() as u64;
        let delay = inner.settings.retry_delay_minutes() * 60;
        let exhausted = attempts > max_retries;

        inner.store.transaction(|tx| {
            events::append(
                tx,
                event::ERROR,
                PIPELINE_SOURCE,
                json!({
                    "email_id": email.id,
                    "stage": stage,
                    "kind": error.kind(),
                    "message": error.to_string(),
                    "attempt": attempts,
                }),
                now,
            )?;
            let mut details = email.details.clone();
            if !details.is_object() {
                details = json!({});
            }
            details["attempts"] = json!(attempts);
            if exhausted {
                details["next_retry_at"] = serde_json::Value::Null;
                emails::set_details(tx, email.id, &details, now)?;
                emails::transition(
                    tx,
                    email.id,
                    EmailState::Failed,
                    event::ERROR,
                    PIPELINE_SOURCE,
                    json!({ "stage": stage, "kind": error.kind(), "final": true }),
                    now,
                )?;
            } else {
                details["next_retry_at"] = json!(now + delay);
                emails::set_details(tx, email.id, &details, now)?;
            }
            Ok(())
        })?;

        if exhausted {
            warn!(email_id = email.id, stage, attempts, "retries exhausted — email failed");
            Ok(ProcessOutcome::Failed)
        } else {
            Ok(ProcessOutcome::Retried)
        }
    }
}

fn format_instant(ts: Timestamp) -> String {
    match Utc.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%d.%m.%Y %H:%M").to_string(),
        None => ts.to_string(),
    }
}
