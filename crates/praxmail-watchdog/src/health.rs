//! Read-only health probes. Each probe reports status, a human message
//! and its own duration; the aggregate is unhealthy only if a probe is
//! unhealthy — warnings never fail overall health (the classifier is
//! optional infrastructure).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use praxmail_core::config::Config;
use praxmail_core::constants::PROBE_DEADLINE_SECS;
use praxmail_core::types::Timestamp;
use praxmail_store::Store;

pub const REQUIRED_TABLES: &[&str] = &["emails", "events", "calendar_slots", "drafts", "settings"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProbeResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub probes: BTreeMap<String, ProbeResult>,
    pub checked_at: Timestamp,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    pub fn failing_probes(&self) -> Vec<&str> {
        self.probes
            .iter()
            .filter(|(_, p)| p.status == HealthStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub struct HealthMonitor {
    store: Arc<Store>,
    config: Config,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(store: Arc<Store>, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_DEADLINE_SECS))
            .build()
            .unwrap_or_default();
        Self { store, config, http }
    }

    /// Run every probe and aggregate.
    pub async fn run_all(&self, now: Timestamp) -> HealthReport {
        let (store_probe, fs_probe, config_probe, classifier_probe) = tokio::join!(
            self.probe_store(),
            self.probe_filesystem(),
            self.probe_config(),
            self.probe_classifier(),
        );

        let mut probes = BTreeMap::new();
        probes.insert("store".to_string(), store_probe);
        probes.insert("filesystem".to_string(), fs_probe);
        probes.insert("config".to_string(), config_probe);
        probes.insert("classifier".to_string(), classifier_probe);

        let status = if probes.values().any(|p| p.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if probes.values().any(|p| p.status == HealthStatus::Warning) {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        HealthReport { status, probes, checked_at: now }
    }

    // ── Probes ───────────────────────────────────────────────────────────────

    async fn probe_store(&self) -> ProbeResult {
        let started = Instant::now();
        let outcome = self.store.ping().and_then(|()| self.store.table_names());
        match outcome {
            Ok(tables) => {
                let missing: Vec<&str> = REQUIRED_TABLES
                    .iter()
                    .filter(|t| !tables.iter().any(|name| name == *t))
                    .copied()
                    .collect();
                if missing.is_empty() {
                    probe(HealthStatus::Healthy, "store reachable", None, started)
                } else {
                    probe(
                        HealthStatus::Unhealthy,
                        "required tables missing",
                        Some(serde_json::json!({ "missing": missing })),
                        started,
                    )
                }
            }
            Err(e) => probe(HealthStatus::Unhealthy, &format!("store ping failed: {e}"), None, started),
        }
    }

    async fn probe_filesystem(&self) -> ProbeResult {
        let started = Instant::now();
        let dir = self.store.db_dir();
        let path = dir.join(".praxmail-health-probe");
        let outcome = std::fs::write(&path, b"probe")
            .and_then(|()| std::fs::read(&path))
            .and_then(|content| {
                std::fs::remove_file(&path)?;
                Ok(content)
            });
        match outcome {
            Ok(content) if content == b"probe" => {
                probe(HealthStatus::Healthy, "data directory writable", None, started)
            }
            Ok(_) => probe(HealthStatus::Unhealthy, "probe file read back corrupted", None, started),
            Err(e) => probe(
                HealthStatus::Unhealthy,
                &format!("cannot write beside the store: {e}"),
                Some(serde_json::json!({ "dir": dir.display().to_string() })),
                started,
            ),
        }
    }

    async fn probe_config(&self) -> ProbeResult {
        let started = Instant::now();
        match self.config.validate() {
            Ok(()) => probe(HealthStatus::Healthy, "configuration complete", None, started),
            Err(e) => probe(HealthStatus::Unhealthy, &e.to_string(), None, started),
        }
    }

    async fn probe_classifier(&self) -> ProbeResult {
        let started = Instant::now();
        if !self.config.ai_configured() {
            return probe(HealthStatus::Warning, "classifier not configured", None, started);
        }
        let Some(url) = self.config.ollama_url.clone() else {
            return probe(HealthStatus::Warning, "classifier URL missing", None, started);
        };
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                probe(HealthStatus::Healthy, "classifier reachable", None, started)
            }
            Ok(resp) => probe(
                HealthStatus::Warning,
                &format!("classifier answered {}", resp.status()),
                None,
                started,
            ),
            // Timeout or refused connection degrades, never fails: the
            // pipeline escalates instead of auto-replying without AI.
            Err(e) => probe(HealthStatus::Warning, &format!("classifier unreachable: {e}"), None, started),
        }
    }
}

fn probe(
    status: HealthStatus,
    message: &str,
    details: Option<serde_json::Value>,
    started: Instant,
) -> ProbeResult {
    ProbeResult {
        status,
        message: message.to_string(),
        details,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(ai: bool) -> Config {
        Config {
            env: "test".into(),
            log_level: "info".into(),
            db_path: PathBuf::from("unused"),
            gmail_enabled: true,
            gmail_client_id: Some("id".into()),
            gmail_client_secret: Some("secret".into()),
            outlook_enabled: false,
            outlook_client_id: None,
            outlook_client_secret: None,
            ai_provider: ai.then(|| "ollama".to_string()),
            ai_model: ai.then(|| "llama3".to_string()),
            // Nothing listens here; the probe must degrade, not fail.
            ollama_url: ai.then(|| "http://127.0.0.1:9".to_string()),
            check_interval_minutes: 1,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn all_green_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("praxmail.db")).unwrap());
        let monitor = HealthMonitor::new(store, config(false));
        let report = monitor.run_all(100).await;

        assert_eq!(report.probes["store"].status, HealthStatus::Healthy);
        assert_eq!(report.probes["filesystem"].status, HealthStatus::Healthy);
        assert_eq!(report.probes["config"].status, HealthStatus::Healthy);
        assert_eq!(report.probes["classifier"].status, HealthStatus::Warning);
        assert_eq!(report.status, HealthStatus::Warning, "warnings do not fail health");
        assert!(report.is_healthy());
        assert_eq!(report.checked_at, 100);
    }

    #[tokio::test]
    async fn unreachable_classifier_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("praxmail.db")).unwrap());
        let monitor = HealthMonitor::new(store, config(true));
        let report = monitor.run_all(0).await;
        assert_eq!(report.probes["classifier"].status, HealthStatus::Warning);
        assert!(report.is_healthy());
    }

    #[tokio::test]
    async fn invalid_config_fails_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("praxmail.db")).unwrap());
        let mut cfg = config(false);
        cfg.gmail_client_secret = None;
        let monitor = HealthMonitor::new(store, cfg);
        let report = monitor.run_all(0).await;
        assert_eq!(report.probes["config"].status, HealthStatus::Unhealthy);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.failing_probes(), vec!["config"]);
    }
}
