//! Thin adapters for the external collaborators. The real provider
//! integrations (OAuth mail retrieval, SMTP) live outside this binary;
//! these implementations are just enough to run the core end to end.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use praxmail_core::error::MailError;
use praxmail_core::types::{Classification, RowId, UNCLEAR_INTENT};
use praxmail_pipeline::{Classifier, Mailer, SendOutcome};

/// Classifier over a local HTTP model endpoint. Expects the contract
/// shape back: `{class, confidence, flags, details}`.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
    model: Option<String>,
}

impl HttpClassifier {
    pub fn new(url: String, model: Option<String>, deadline: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(deadline).build().unwrap_or_default();
        Self { client, url, model }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, MailError> {
        let body = serde_json::json!({ "model": self.model, "text": text });
        let resp = self
            .client
            .post(format!("{}/classify", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| MailError::Classifier(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MailError::Classifier(format!("classifier answered {}", resp.status())));
        }
        resp.json::<Classification>().await.map_err(|e| MailError::Classifier(e.to_string()))
    }
}

/// Keyword fallback used when no AI provider is configured. Confidence
/// stays below the default auto-send threshold for anything but the
/// clearest appointment requests, so the guard keeps humans in the loop.
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, MailError> {
        let (class, confidence) = if text.contains("rezept") {
            ("rezept_anfrage", 0.9)
        } else if text.contains("krankschreibung") || text.contains("arbeitsunfähigkeit") {
            ("au_anfrage", 0.9)
        } else if text.contains("termin") {
            ("termin_anfrage", 0.85)
        } else {
            (UNCLEAR_INTENT, 0.4)
        };
        Ok(Classification {
            class: class.to_string(),
            confidence,
            flags: vec![],
            details: serde_json::json!({}),
        })
    }
}

/// Send adapter that only logs. Stands in until a provider adapter is
/// wired; idempotent by construction (same correlation id, same log line).
pub struct DryRunMailer;

#[async_trait]
impl Mailer for DryRunMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        correlation_id: RowId,
    ) -> Result<SendOutcome, MailError> {
        info!(to, subject, draft_id = correlation_id, bytes = body.len(), "dry-run send");
        Ok(SendOutcome { provider_id: format!("dry-run-{correlation_id}") })
    }
}
