//! Reply templates. Rendering is a pure function from
//! `(template_id, vars)` to text; every non-signature rendering gets the
//! practice signature appended.

use minijinja::Environment;

use praxmail_core::error::MailError;

pub const TERMIN_VORSCHLAG: &str = "termin_vorschlag";
pub const TERMIN_BESTAETIGUNG: &str = "termin_bestaetigung";
pub const TERMIN_ABSAGE: &str = "termin_absage";
pub const FAQ_ANTWORT: &str = "faq_antwort";
pub const VORSICHT_SENSIBEL: &str = "vorsicht_sensibel";
pub const SIGNATUR: &str = "signatur";

const SOURCES: &[(&str, &str)] = &[
    (
        TERMIN_VORSCHLAG,
        "Guten Tag{% if patient_name %} {{ patient_name }}{% endif %},\n\n\
         vielen Dank für Ihre Terminanfrage. Wir können Ihnen folgenden Termin anbieten:\n\n\
         {{ slot_start }} – {{ slot_end }}\n\n\
         Bitte bestätigen Sie den Vorschlag kurz per Antwort auf diese E-Mail. \
         Der Termin wird bis dahin für Sie freigehalten.",
    ),
    (
        TERMIN_BESTAETIGUNG,
        "Guten Tag{% if patient_name %} {{ patient_name }}{% endif %},\n\n\
         hiermit bestätigen wir Ihren Termin am {{ slot_start }}. \
         Bitte bringen Sie Ihre Versichertenkarte mit.",
    ),
    (
        TERMIN_ABSAGE,
        "Guten Tag{% if patient_name %} {{ patient_name }}{% endif %},\n\n\
         leider müssen wir den Termin am {{ slot_start }} absagen. \
         Wir melden uns zeitnah mit einem neuen Vorschlag.",
    ),
    (
        FAQ_ANTWORT,
        "Guten Tag{% if patient_name %} {{ patient_name }}{% endif %},\n\n\
         vielen Dank für Ihre Nachricht.\n\n{{ answer }}",
    ),
    (
        VORSICHT_SENSIBEL,
        "Guten Tag{% if patient_name %} {{ patient_name }}{% endif %},\n\n\
         vielen Dank für Ihre Nachricht. Ihr Anliegen wird von unserem \
         Praxisteam persönlich geprüft; wir melden uns so schnell wie möglich bei Ihnen.",
    ),
    (
        SIGNATUR,
        "Mit freundlichen Grüßen\n\
         {{ practice_name | default('Ihre Praxis') }}\n\
         {% if practice_phone %}Telefon: {{ practice_phone }}\n{% endif %}\
         \nDiese Nachricht wurde automatisch erstellt.",
    ),
];

/// Capability seam for rendering; the pipeline depends on this trait,
/// tests swap in a fake.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template_id: &str, vars: &serde_json::Value) -> Result<String, MailError>;
}

/// The built-in engine over the embedded template sources.
pub struct PracticeTemplates {
    env: Environment<'static>,
}

impl PracticeTemplates {
    pub fn new() -> Result<Self, MailError> {
        let mut env = Environment::new();
        for (name, source) in SOURCES {
            env.add_template(name, source)
                .map_err(|e| MailError::Template(format!("{name}: {e}")))?;
        }
        Ok(Self { env })
    }
}

impl TemplateEngine for PracticeTemplates {
    fn render(&self, template_id: &str, vars: &serde_json::Value) -> Result<String, MailError> {
        let template = self
            .env
            .get_template(template_id)
            .map_err(|_| MailError::UnknownTemplate(template_id.to_string()))?;
        let body = template
            .render(vars)
            .map_err(|e| MailError::Template(e.to_string()))?;
        if template_id == SIGNATUR {
            return Ok(body);
        }
        let signature = self
            .env
            .get_template(SIGNATUR)
            .map_err(|_| MailError::UnknownTemplate(SIGNATUR.to_string()))?
            .render(vars)
            .map_err(|e| MailError::Template(e.to_string()))?;
        Ok(format!("{body}\n\n{signature}"))
    }
}
