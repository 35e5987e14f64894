//! Classifier contract. The implementation (rules, LLM, hybrid) lives
//! outside the core; this seam only fixes the output shape and the
//! sanitation the pipeline applies before trusting it.

use async_trait::async_trait;

use praxmail_core::error::MailError;
use praxmail_core::types::{Classification, UNCLEAR_INTENT};

/// Pure intent classification over normalized text. Must not perform side
/// effects the core can observe; errors are retryable.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, MailError>;
}

/// Clamp the classifier output into the contract: confidence in [0, 1],
/// empty or whitespace class treated as unknown intent.
pub fn sanitize(mut c: Classification) -> Classification {
    if c.class.trim().is_empty() {
        c.class = UNCLEAR_INTENT.to_string();
    }
    if !c.confidence.is_finite() {
        c.confidence = 0.0;
    }
    c.confidence = c.confidence.clamp(0.0, 1.0);
    if !c.details.is_object() {
        c.details = serde_json::json!({});
    }
    c
}

/// Whether a class names an appointment request (drives the calendar
/// hold-and-propose flow).
pub fn is_appointment_class(class: &str) -> bool {
    let lower = class.to_lowercase();
    lower.contains("termin") || lower.contains("appointment")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_class_becomes_unclear_intent() {
        let c = sanitize(Classification {
            class: "  ".into(),
            confidence: 0.5,
            flags: vec![],
            details: serde_json::json!({}),
        });
        assert_eq!(c.class, UNCLEAR_INTENT);
    }

    #[test]
    fn confidence_is_clamped() {
        let clamp = |v: f64| {
            sanitize(Classification {
                class: "Termin".into(),
                confidence: v,
                flags: vec![],
                details: serde_json::json!({}),
            })
            .confidence
        };
        assert_eq!(clamp(1.7), 1.0);
        assert_eq!(clamp(-0.3), 0.0);
        assert_eq!(clamp(f64::NAN), 0.0);
        assert_eq!(clamp(0.95), 0.95);
    }

    #[test]
    fn appointment_detection() {
        assert!(is_appointment_class("Termin"));
        assert!(is_appointment_class("termin_anfrage"));
        assert!(is_appointment_class("appointment_request"));
        assert!(!is_appointment_class("rezept_anfrage"));
    }
}
