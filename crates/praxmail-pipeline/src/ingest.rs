//! Idempotency filter: at-least-once delivery in, exactly-once rows out.
//!
//! A message is a duplicate iff its `message_id` already exists or the
//! hash of its normalized body matches a stored one (same content under a
//! different message id). Both checks and the insert run in one
//! transaction, so two racing deliveries of the same message cannot both
//! insert.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use praxmail_core::constants::PIPELINE_SOURCE;
use praxmail_core::error::MailError;
use praxmail_core::event;
use praxmail_core::types::{NewEmail, RowId, Timestamp};
use praxmail_store::{emails, events, Store};

/// Result of submitting one message. `email_id` points at the winning row
/// either way, so re-submission always resolves to the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestOutcome {
    pub email_id: RowId,
    pub duplicate: bool,
}

/// Lowercase, fold CR/LF runs to one LF, collapse other whitespace runs
/// to one space, strip everything outside word chars / space / newline /
/// `.,!?@-`, trim.
pub fn normalize_body(body: &str) -> String {
    let lowered = body.to_lowercase();

    // CR/LF runs first, so newlines survive the whitespace collapse.
    let mut folded = String::with_capacity(lowered.len());
    let mut chars = lowered.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' || c == '\n' {
            while matches!(chars.peek(), Some('\r') | Some('\n')) {
                chars.next();
            }
            folded.push('\n');
        } else {
            folded.push(c);
        }
    }

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for c in folded.chars() {
        if c == '\n' {
            pending_space = false;
            out.push('\n');
        } else if c.is_whitespace() {
            pending_space = true;
        } else if c.is_alphanumeric() || matches!(c, '_' | '.' | ',' | '!' | '?' | '@' | '-') {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
        // Stripped characters emit nothing; the next kept character
        // decides whether a pending space materializes.
    }
    out.trim_matches(|c: char| c == ' ' || c == '\n').to_string()
}

/// Hex-encoded SHA-256 of the normalized body. Deliberately independent
/// of the message id, so the same content resubmitted under a fresh id
/// still deduplicates.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

pub struct IngestFilter {
    store: Arc<Store>,
}

impl IngestFilter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Submit one message. First delivery inserts the email (state
    /// INGESTED, hash stored) and appends `email.received`; repeats
    /// return the original row id with `duplicate = true` and append
    /// nothing.
    pub fn ingest(&self, msg: &NewEmail, now: Timestamp) -> Result<IngestOutcome, MailError> {
        let hash = content_hash(&msg.body_text);
        self.store.transaction(|tx| {
            if let Some(existing) = emails::id_by_message_id(tx, &msg.message_id)? {
                debug!(message_id = %msg.message_id, "duplicate by message_id");
                return Ok(IngestOutcome { email_id: existing, duplicate: true });
            }
            if let Some(existing) = emails::id_by_text_hash(tx, &hash)? {
                debug!(message_id = %msg.message_id, "duplicate by content hash");
                return Ok(IngestOutcome { email_id: existing, duplicate: true });
            }
            let email_id = emails::insert(tx, msg, Some(&hash), now)?;
            events::append(
                tx,
                event::EMAIL_RECEIVED,
                PIPELINE_SOURCE,
                serde_json::json!({
                    "email_id": email_id,
                    "message_id": msg.message_id,
                    "account": msg.account,
                }),
                now,
            )?;
            Ok(IngestOutcome { email_id, duplicate: false })
        })
    }

    /// Batch submission; additionally rejects repeats within the batch
    /// itself using an in-memory set, before they reach the store.
    pub fn ingest_batch(
        &self,
        msgs: &[NewEmail],
        now: Timestamp,
    ) -> Result<Vec<IngestOutcome>, MailError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut outcomes = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let hash = content_hash(&msg.body_text);
            let fresh_id = seen.insert(msg.message_id.clone());
            let fresh_hash = seen.insert(hash.clone());
            if !fresh_id || !fresh_hash {
                // In-batch repeat: the first occurrence already owns the
                // row; resolve its id for the outcome.
                let existing = self.store.with_conn(|conn| {
                    if let Some(id) = emails::id_by_message_id(conn, &msg.message_id)? {
                        return Ok(Some(id));
                    }
                    emails::id_by_text_hash(conn, &hash)
                })?;
                outcomes.push(IngestOutcome {
                    email_id: existing.unwrap_or_default(),
                    duplicate: true,
                });
                continue;
            }
            outcomes.push(self.ingest(msg, now)?);
        }
        Ok(outcomes)
    }
}
