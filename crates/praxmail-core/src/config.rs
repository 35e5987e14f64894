//! Process configuration, read once from the environment at startup.
//!
//! Validation rejects configurations that could never process mail: no
//! provider enabled, or a provider enabled without its credential pair.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MailError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub env: String,
    pub log_level: String,
    pub db_path: PathBuf,

    pub gmail_enabled: bool,
    pub gmail_client_id: Option<String>,
    pub gmail_client_secret: Option<String>,

    pub outlook_enabled: bool,
    pub outlook_client_id: Option<String>,
    pub outlook_client_secret: Option<String>,

    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub ollama_url: Option<String>,

    pub check_interval_minutes: u64,
    pub max_retries: u32,
}

impl Config {
    /// Read configuration from the process environment and validate it.
    pub fn from_env() -> Result<Self, MailError> {
        let cfg = Self {
            env: var("NODE_ENV").or_else(|| var("ENV")).unwrap_or_else(|| "development".into()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            db_path: PathBuf::from(var("DB_PATH").unwrap_or_else(|| "data/praxmail.db".into())),

            gmail_enabled: var_bool("GMAIL_ENABLED"),
            gmail_client_id: var("GMAIL_CLIENT_ID"),
            gmail_client_secret: var("GMAIL_CLIENT_SECRET"),

            outlook_enabled: var_bool("OUTLOOK_ENABLED"),
            outlook_client_id: var("OUTLOOK_CLIENT_ID"),
            outlook_client_secret: var("OUTLOOK_CLIENT_SECRET"),

            ai_provider: var("AI_PROVIDER"),
            ai_model: var("AI_MODEL"),
            ollama_url: var("OLLAMA_URL"),

            check_interval_minutes: var("CHECK_INTERVAL_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            max_retries: var("MAX_RETRIES").and_then(|v| v.parse().ok()).unwrap_or(3),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), MailError> {
        if !self.gmail_enabled && !self.outlook_enabled {
            return Err(MailError::Config(
                "no mail provider enabled (set GMAIL_ENABLED or OUTLOOK_ENABLED)".into(),
            ));
        }
        if self.gmail_enabled
            && (self.gmail_client_id.is_none() || self.gmail_client_secret.is_none())
        {
            return Err(MailError::Config(
                "GMAIL_ENABLED requires GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET".into(),
            ));
        }
        if self.outlook_enabled
            && (self.outlook_client_id.is_none() || self.outlook_client_secret.is_none())
        {
            return Err(MailError::Config(
                "OUTLOOK_ENABLED requires OUTLOOK_CLIENT_ID and OUTLOOK_CLIENT_SECRET".into(),
            ));
        }
        if self.check_interval_minutes == 0 {
            return Err(MailError::Config("CHECK_INTERVAL_MINUTES must be >= 1".into()));
        }
        Ok(())
    }

    /// Whether the AI classifier is configured at all. Absent AI is legal;
    /// the health probe then reports a warning rather than unhealthy.
    pub fn ai_configured(&self) -> bool {
        self.ai_provider.is_some()
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_bool(key: &str) -> bool {
    matches!(var(key).as_deref(), Some("1") | Some("true") | Some("TRUE") | Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            env: "test".into(),
            log_level: "info".into(),
            db_path: PathBuf::from("data/test.db"),
            gmail_enabled: true,
            gmail_client_id: Some("id".into()),
            gmail_client_secret: Some("secret".into()),
            outlook_enabled: false,
            outlook_client_id: None,
            outlook_client_secret: None,
            ai_provider: None,
            ai_model: None,
            ollama_url: None,
            check_interval_minutes: 1,
            max_retries: 3,
        }
    }

    #[test]
    fn valid_gmail_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn no_provider_rejected() {
        let mut cfg = base();
        cfg.gmail_enabled = false;
        assert!(matches!(cfg.validate(), Err(MailError::Config(_))));
    }

    #[test]
    fn enabled_provider_without_credentials_rejected() {
        let mut cfg = base();
        cfg.gmail_client_secret = None;
        assert!(matches!(cfg.validate(), Err(MailError::Config(_))));

        let mut cfg = base();
        cfg.gmail_enabled = false;
        cfg.outlook_enabled = true;
        assert!(matches!(cfg.validate(), Err(MailError::Config(_))));
    }
}
