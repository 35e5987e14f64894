//! The watchdog loop: every tick runs the health check, the calendar
//! expiry sweep and audit-log pruning concurrently, records a heartbeat
//! event, and keeps the shared health flag current for the pipeline.
//!
//! Ticks are single-flight (a slow tick is never overlapped by the next
//! timer firing) and failures inside one task never abort the others.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use praxmail_calendar::CalendarCoordinator;
use praxmail_core::constants::WATCHDOG_SOURCE;
use praxmail_core::event;
use praxmail_core::types::Timestamp;
use praxmail_store::{events, SettingsRegistry, Store};

use crate::health::{HealthMonitor, HealthReport};

/// What one tick did; `ran` is false when another tick was in flight.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickReport {
    pub ran: bool,
    pub released_holds: usize,
    pub healthy: bool,
}

pub struct Watchdog {
    store: Arc<Store>,
    calendar: Arc<CalendarCoordinator>,
    settings: Arc<SettingsRegistry>,
    monitor: HealthMonitor,
    healthy: Arc<AtomicBool>,
    last_report: Mutex<Option<HealthReport>>,
    ticking: AtomicBool,
    runs: AtomicU64,
}

impl Watchdog {
    pub fn new(
        store: Arc<Store>,
        calendar: Arc<CalendarCoordinator>,
        settings: Arc<SettingsRegistry>,
        monitor: HealthMonitor,
        healthy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            calendar,
            settings,
            monitor,
            healthy,
            last_report: Mutex::new(None),
            ticking: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Tick on a fixed cadence until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("watchdog stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// One housekeeping pass at an explicit instant (tests drive the clock).
    pub async fn tick_at(&self, now: Timestamp) -> TickReport {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return TickReport::default();
        }
        let started = std::time::Instant::now();

        // The tasks run concurrently; each swallows and logs its own
        // failure so the others still complete.
        let (healthy, released, _pruned) =
            tokio::join!(self.run_health(now), self.sweep_holds(now), self.prune_audit(now));

        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let duration_ms = started.elapsed().as_millis() as u64;
        let heartbeat = self.store.transaction(|tx| {
            events::append(
                tx,
                event::WATCHDOG_TICK,
                WATCHDOG_SOURCE,
                json!({ "runs": runs, "duration_ms": duration_ms }),
                now,
            )
        });
        if let Err(e) = heartbeat {
            warn!(error = %e, "failed to record watchdog heartbeat");
        }

        self.ticking.store(false, Ordering::SeqCst);
        TickReport { ran: true, released_holds: released, healthy }
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        match self.last_report.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    // ── Tick tasks ───────────────────────────────────────────────────────────

    async fn run_health(&self, now: Timestamp) -> bool {
        let report = self.monitor.run_all(now).await;
        let is_healthy = report.is_healthy();
        self.healthy.store(is_healthy, Ordering::SeqCst);

        if !is_healthy {
            let failing: Vec<String> =
                report.failing_probes().iter().map(|s| s.to_string()).collect();
            warn!(?failing, "health check failed");
            let recorded = self.store.transaction(|tx| {
                events::append(
                    tx,
                    event::HEALTH_CHECK_FAILED,
                    WATCHDOG_SOURCE,
                    json!({ "failing": failing }),
                    now,
                )
            });
            if let Err(e) = recorded {
                warn!(error = %e, "failed to record health event");
            }
        }

        match self.last_report.lock() {
            Ok(mut guard) => *guard = Some(report),
            Err(poisoned) => *poisoned.into_inner() = Some(report),
        }
        is_healthy
    }

    async fn sweep_holds(&self, now: Timestamp) -> usize {
        match self.calendar.release_expired_holds(now) {
            Ok(0) => 0,
            Ok(released) => {
                info!(released, "expired calendar holds released");
                let recorded = self.store.transaction(|tx| {
                    events::append(
                        tx,
                        event::HOLDS_RELEASED,
                        WATCHDOG_SOURCE,
                        json!({ "count": released }),
                        now,
                    )
                });
                if let Err(e) = recorded {
                    warn!(error = %e, "failed to record holds_released event");
                }
                released
            }
            Err(e) => {
                warn!(error = %e, "expired hold sweep failed");
                0
            }
        }
    }

    /// Delete processed audit events past the retention horizon.
    async fn prune_audit(&self, now: Timestamp) -> usize {
        let retention = self.settings.audit_retention_days();
        match self.store.transaction(|tx| events::prune(tx, retention, now)) {
            Ok(0) => 0,
            Ok(pruned) => {
                info!(pruned, "old audit events pruned");
                pruned
            }
            Err(e) => {
                warn!(error = %e, "audit pruning failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use praxmail_core::config::Config;
    use praxmail_core::types::SlotInput;
    use std::path::PathBuf;

    fn config() -> Config {
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
            ai_provider: None,
            ai_model: None,
            ollama_url: None,
            check_interval_minutes: 1,
            max_retries: 3,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        calendar: Arc<CalendarCoordinator>,
        dog: Watchdog,
        healthy: Arc<AtomicBool>,
    }

    fn watchdog() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("praxmail.db")).unwrap());
        let calendar = Arc::new(CalendarCoordinator::new(Arc::clone(&store)));
        let settings = Arc::new(SettingsRegistry::new(Arc::clone(&store)));
        settings.initialize_defaults().unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(Arc::clone(&store), config());
        let dog = Watchdog::new(
            Arc::clone(&store),
            Arc::clone(&calendar),
            settings,
            monitor,
            Arc::clone(&healthy),
        );
        Fixture { _dir: dir, store, calendar, dog, healthy }
    }

    #[tokio::test]
    async fn tick_records_heartbeat_and_sets_health() {
        let f = watchdog();
        let report = f.dog.tick_at(100).await;
        assert!(report.ran);
        assert!(report.healthy);
        assert!(f.healthy.load(Ordering::SeqCst), "shared flag follows the report");
        assert_eq!(f.dog.runs(), 1);
        assert!(f.dog.last_report().is_some());

        let beats = f.store
            .with_conn(|c| events::in_window(c, event::WATCHDOG_TICK, 0, 1_000))
            .unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].payload["runs"], json!(1));
    }

    #[tokio::test]
    async fn tick_releases_expired_holds_and_emits_event() {
        let f = watchdog();
        let slot = f.calendar
            .create_or_update_slot(
                &SlotInput { calendar_id: "primary".into(), start_time: 1_000, end_time: 2_800 },
                0,
            )
            .unwrap();
        assert!(f.calendar.hold(slot, 7, 1, 0).unwrap());

        // Two minutes later the one-minute hold is expired.
        let report = f.dog.tick_at(120).await;
        assert_eq!(report.released_holds, 1);
        let released = f.store
            .with_conn(|c| events::in_window(c, event::HOLDS_RELEASED, 0, 1_000))
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].payload["count"], json!(1));

        // Idempotent: the second sweep finds nothing and stays silent.
        let report = f.dog.tick_at(240).await;
        assert_eq!(report.released_holds, 0);
        let released = f.store
            .with_conn(|c| events::in_window(c, event::HOLDS_RELEASED, 0, 1_000))
            .unwrap();
        assert_eq!(released.len(), 1, "no event when count is zero");
    }

    #[tokio::test]
    async fn tick_prunes_processed_audit_events() {
        let f = watchdog();
        let old = f
            .store
            .transaction(|tx| events::append(tx, "custom.mark", "test", json!({}), 0))
            .unwrap();
        f.store.transaction(|tx| events::mark_processed(tx, old)).unwrap();

        // Default retention is 90 days; day 91 sweeps the processed event.
        let now = 91 * 86_400;
        f.dog.tick_at(now).await;
        let remaining = f.store.with_conn(|c| events::in_window(c, "custom.mark", 0, now)).unwrap();
        assert!(remaining.is_empty(), "processed event past retention is gone");
    }

    #[tokio::test]
    async fn concurrent_tick_is_single_flight() {
        let f = watchdog();
        f.dog.ticking.store(true, Ordering::SeqCst);
        let report = f.dog.tick_at(100).await;
        assert!(!report.ran, "overlapping tick must be skipped");
        f.dog.ticking.store(false, Ordering::SeqCst);
        assert!(f.dog.tick_at(101).await.ran);
    }
}
