//! Rule evaluation, fixed order, first match wins.
//!
//! Order: foreign language → sensitive category → mixed intent → KB
//! policy → low confidence → manual approval → auto-send switch → pass.
//! Reasons are never combined; the first matching rule decides alone.

use praxmail_core::types::{Decision, EmailContext, GuardSettings};

/// Flags that mark a message as not answerable in German boilerplate.
const LANGUAGE_FLAGS: &[&str] = &["FOREIGN_LANGUAGE", "NON_GERMAN", "TRANSLATION_NEEDED"];

/// Class substrings that always require a human (prescriptions, sick
/// notes, unclear requests).
const SENSITIVE_CLASSES: &[&str] =
    &["rezept", "prescription", "au_", "arbeitsunfähigkeit", "unclear_intent"];

const MIXED_CLASS_MARKERS: &[&str] = &["mixed", "mehrfach"];
const MIXED_FLAGS: &[&str] = &["MIXED_INTENT", "MULTIPLE_REQUESTS"];

/// KB complexity at or above this score escalates.
const KB_COMPLEXITY_LIMIT: f64 = 0.8;

/// Evaluate the guard rules for one email against a settings snapshot.
pub fn evaluate(ctx: &EmailContext, settings: &GuardSettings) -> Decision {
    // 1. Foreign language
    if ctx.flags.iter().any(|f| LANGUAGE_FLAGS.contains(&f.as_str())) {
        return Decision::escalate("language", &["FOREIGN_LANGUAGE"]);
    }

    // 2. Sensitive category
    let klass_lower = ctx.klass.to_lowercase();
    if SENSITIVE_CLASSES.iter().any(|s| klass_lower.contains(s)) {
        return Decision::escalate(format!("sensitive_{}", ctx.klass), &["SENSITIVE_CATEGORY"]);
    }

    // 3. Mixed intent
    if MIXED_CLASS_MARKERS.iter().any(|m| klass_lower.contains(m))
        || ctx.flags.iter().any(|f| MIXED_FLAGS.contains(&f.as_str()))
    {
        return Decision::escalate("mixed_intent", &["MIXED_INTENT"]);
    }

    // 4. KB policy violations
    if let Some(kb) = &ctx.kb_policy {
        if kb.requires_doctor {
            return Decision::escalate("requires_doctor_attention", &["KB_POLICY_VIOLATION"]);
        }
        if kb.requires_privacy_check {
            return Decision::escalate("requires_privacy_check", &["KB_POLICY_VIOLATION"]);
        }
        if kb.complexity_score >= KB_COMPLEXITY_LIMIT {
            return Decision::escalate("high_complexity", &["KB_POLICY_VIOLATION"]);
        }
    }

    // 5. Low confidence — inclusive at the threshold.
    if ctx.confidence < settings.confidence_threshold {
        return Decision::escalate(
            format!("low_confidence_{:.2}", ctx.confidence),
            &["LOW_CONFIDENCE"],
        );
    }

    // 6. Manual approval required
    if settings.require_manual_approval {
        return Decision::escalate("manual_approval", &["MANUAL_APPROVAL_REQUIRED"]);
    }

    // 7. Auto-send master switch
    if !settings.auto_send_enabled {
        return Decision::escalate("auto_send_disabled", &["AUTO_SEND_DISABLED"]);
    }

    // 8. All checks passed
    Decision::auto("all_checks_passed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use praxmail_core::types::KbPolicy;

    fn ctx(klass: &str, confidence: f64, flags: &[&str]) -> EmailContext {
        EmailContext {
            email_id: 1,
            klass: klass.to_string(),
            confidence,
            flags: flags.iter().map(|f| (*f).to_string()).collect(),
            details: serde_json::json!({}),
            kb_policy: None,
        }
    }

    fn permissive() -> GuardSettings {
        GuardSettings {
            auto_send_enabled: true,
            confidence_threshold: 0.95,
            require_manual_approval: false,
        }
    }

    #[test]
    fn happy_path_passes_all_checks() {
        let d = evaluate(&ctx("Termin", 0.98, &[]), &permissive());
        assert!(d.auto);
        assert_eq!(d.reason, "all_checks_passed");
        assert!(d.escalate_flags.is_empty());
    }

    #[test]
    fn foreign_language_wins_over_everything() {
        let d = evaluate(&ctx("rezept_anfrage", 0.1, &["FOREIGN_LANGUAGE"]), &permissive());
        assert!(!d.auto);
        assert_eq!(d.reason, "language");
        assert_eq!(d.escalate_flags, vec!["FOREIGN_LANGUAGE"]);
    }

    #[test]
    fn prescription_class_is_sensitive() {
        let d = evaluate(&ctx("rezept_anfrage", 0.99, &[]), &permissive());
        assert!(!d.auto);
        assert_eq!(d.reason, "sensitive_rezept_anfrage");
        assert_eq!(d.escalate_flags, vec!["SENSITIVE_CATEGORY"]);
    }

    #[test]
    fn sensitive_match_is_case_insensitive() {
        let d = evaluate(&ctx("Rezept_Wiederholung", 0.99, &[]), &permissive());
        assert_eq!(d.reason, "sensitive_Rezept_Wiederholung");

        let d = evaluate(&ctx("AU_Bescheinigung", 0.99, &[]), &permissive());
        assert_eq!(d.escalate_flags, vec!["SENSITIVE_CATEGORY"]);

        let d = evaluate(&ctx("unclear_intent", 0.99, &[]), &permissive());
        assert_eq!(d.reason, "sensitive_unclear_intent");
    }

    #[test]
    fn mixed_intent_by_class_or_flag() {
        let d = evaluate(&ctx("mehrfach_anliegen", 0.99, &[]), &permissive());
        assert_eq!(d.reason, "mixed_intent");
        assert_eq!(d.escalate_flags, vec!["MIXED_INTENT"]);

        let d = evaluate(&ctx("Termin", 0.99, &["MULTIPLE_REQUESTS"]), &permissive());
        assert_eq!(d.reason, "mixed_intent");
    }

    #[test]
    fn kb_policy_rules_in_order() {
        let mut c = ctx("Termin", 0.99, &[]);
        c.kb_policy = Some(KbPolicy {
            requires_doctor: true,
            requires_privacy_check: true,
            complexity_score: 1.0,
        });
        let d = evaluate(&c, &permissive());
        assert_eq!(d.reason, "requires_doctor_attention");
        assert_eq!(d.escalate_flags, vec!["KB_POLICY_VIOLATION"]);

        c.kb_policy = Some(KbPolicy {
            requires_doctor: false,
            requires_privacy_check: true,
            complexity_score: 1.0,
        });
        assert_eq!(evaluate(&c, &permissive()).reason, "requires_privacy_check");

        c.kb_policy = Some(KbPolicy {
            requires_doctor: false,
            requires_privacy_check: false,
            complexity_score: 0.8,
        });
        assert_eq!(evaluate(&c, &permissive()).reason, "high_complexity");

        c.kb_policy = Some(KbPolicy {
            requires_doctor: false,
            requires_privacy_check: false,
            complexity_score: 0.79,
        });
        assert!(evaluate(&c, &permissive()).auto);
    }

    #[test]
    fn confidence_exactly_at_threshold_passes() {
        let d = evaluate(&ctx("appointment_request", 0.95, &[]), &permissive());
        assert!(d.auto, "inclusive comparison: 0.95 >= 0.95 passes");
    }

    #[test]
    fn confidence_just_below_threshold_escalates() {
        let d = evaluate(&ctx("appointment_request", 0.9499, &[]), &permissive());
        assert!(!d.auto);
        assert_eq!(d.reason, "low_confidence_0.95", "formatted to two decimals");
        assert_eq!(d.escalate_flags, vec!["LOW_CONFIDENCE"]);
    }

    #[test]
    fn manual_approval_blocks_before_master_switch() {
        let settings = GuardSettings {
            auto_send_enabled: false,
            confidence_threshold: 0.95,
            require_manual_approval: true,
        };
        let d = evaluate(&ctx("Termin", 0.99, &[]), &settings);
        assert_eq!(d.reason, "manual_approval");
        assert_eq!(d.escalate_flags, vec!["MANUAL_APPROVAL_REQUIRED"]);
    }

    #[test]
    fn auto_send_disabled_is_the_last_gate() {
        let settings = GuardSettings {
            auto_send_enabled: false,
            confidence_threshold: 0.95,
            require_manual_approval: false,
        };
        let d = evaluate(&ctx("Termin", 0.99, &[]), &settings);
        assert_eq!(d.reason, "auto_send_disabled");
        assert_eq!(d.escalate_flags, vec!["AUTO_SEND_DISABLED"]);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let c = ctx("Termin", 0.97, &[]);
        let s = permissive();
        let first = evaluate(&c, &s);
        for _ in 0..10 {
            assert_eq!(evaluate(&c, &s), first);
        }
    }
}
