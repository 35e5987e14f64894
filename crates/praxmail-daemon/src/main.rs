//! praxmail — the practice-mail assistant daemon.
//!
//! Startup sequence (`dev`):
//!   1. Read and validate the environment configuration
//!   2. Open (or initialise) the store and run migrations
//!   3. Seed default settings
//!   4. Start the pipeline runner and the watchdog
//!   5. On ctrl-c: stop intake, let in-flight work finish, close the store
//!
//! `health` runs every probe once and exits 0 (healthy), 1 (unhealthy)
//! or 2 (the check itself could not run).

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use praxmail_calendar::CalendarCoordinator;
use praxmail_core::constants::{PROBE_DEADLINE_SECS, WATCHDOG_INTERVAL_SECS};
use praxmail_core::Config;
use praxmail_pipeline::{Classifier, Mailer, PipelineRunner};
use praxmail_store::{SettingsRegistry, Store};
use praxmail_templates::PracticeTemplates;
use praxmail_watchdog::{HealthMonitor, Watchdog};

mod adapters;
use adapters::{DryRunMailer, HttpClassifier, KeywordClassifier};

#[derive(Parser, Debug)]
#[command(name = "praxmail", version, about = "Practice mail assistant — pipeline and watchdog")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the pipeline runner and the watchdog.
    Dev,
    /// Run all health probes once and exit 0/1/2.
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,praxmail=debug".parse().unwrap()),
        )
        .init();

    match args.command {
        Command::Dev => match dev().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::from(2)
            }
        },
        Command::Health => health().await,
    }
}

async fn dev() -> anyhow::Result<()> {
    let config = Config::from_env().context("reading configuration")?;
    info!(env = %config.env, db = %config.db_path.display(), "praxmail starting");

    // ── Store and settings ────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.db_path).context("opening store")?);
    let settings = Arc::new(SettingsRegistry::new(Arc::clone(&store)));
    settings.initialize_defaults().context("seeding default settings")?;

    // ── Services ──────────────────────────────────────────────────────────────
    let calendar = Arc::new(CalendarCoordinator::new(Arc::clone(&store)));
    let healthy = Arc::new(AtomicBool::new(true));

    let classifier: Arc<dyn Classifier> = match (&config.ai_provider, &config.ollama_url) {
        (Some(_), Some(url)) => Arc::new(HttpClassifier::new(
            url.clone(),
            config.ai_model.clone(),
            Duration::from_secs(PROBE_DEADLINE_SECS * 4),
        )),
        _ => {
            warn!("no AI provider configured — using keyword classifier");
            Arc::new(KeywordClassifier)
        }
    };
    let mailer: Arc<dyn Mailer> = Arc::new(DryRunMailer);
    let templates = Arc::new(PracticeTemplates::new().context("building templates")?);

    let runner = PipelineRunner::new(
        Arc::clone(&store),
        Arc::clone(&settings),
        classifier,
        mailer,
        templates,
        Arc::clone(&calendar),
        Arc::clone(&healthy),
    );
    let monitor = HealthMonitor::new(Arc::clone(&store), config.clone());
    let watchdog = Arc::new(Watchdog::new(
        Arc::clone(&store),
        Arc::clone(&calendar),
        Arc::clone(&settings),
        monitor,
        Arc::clone(&healthy),
    ));

    // ── Run until ctrl-c ──────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pipeline_task = tokio::spawn(runner.run(
        Duration::from_secs(config.check_interval_minutes * 60),
        shutdown_rx.clone(),
    ));
    let watchdog_task = tokio::spawn(
        Arc::clone(&watchdog).run(Duration::from_secs(WATCHDOG_INTERVAL_SECS), shutdown_rx),
    );

    info!("praxmail ready");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    // Stop intake, then give in-flight work a grace period.
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(10);
    if tokio::time::timeout(grace, async {
        let _ = pipeline_task.await;
        let _ = watchdog_task.await;
    })
    .await
    .is_err()
    {
        warn!("grace period elapsed before tasks finished");
    }
    info!("praxmail stopped");
    Ok(())
}

async fn health() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // A broken configuration is a determinate unhealthy verdict,
            // not a failure of the check itself.
            eprintln!("config: {e}");
            return ExitCode::from(1);
        }
    };
    let store = match Store::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("store: {e}");
            return ExitCode::from(2);
        }
    };

    let monitor = HealthMonitor::new(store, config);
    let report = monitor.run_all(chrono::Utc::now().timestamp()).await;
    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => {
            eprintln!("render: {e}");
            return ExitCode::from(2);
        }
    }
    if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
