//! RSS Sentinel - game-aware network interrupt tuning
//!
//! Watches for running games and moves RSS (receive side scaling) processing
//! onto CPU cores free of other device interrupts while one is active. Every
//! change is probed against the default gateway and rolled back on loss of
//! connectivity.

#![allow(dead_code)] // Several accessors exist for status reporting and tests

mod cli;
mod core;
mod persistence;
mod platform;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use single_instance::SingleInstance;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{
    Autopilot, SafeApplyTransaction, SettingsHandle, StatusEvent, StopSignal,
    SysinfoProcessMonitor, TopologyProbe,
};
use crate::persistence::Database;

/// Application name constant
pub const APP_NAME: &str = "RSSSentinel";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Status events buffered between the loop and the history writer
const STATUS_CHANNEL_CAPACITY: usize = 32;

fn main() -> Result<()> {
    let cli_args = cli::Cli::parse();

    if cli_args.runs_daemon() {
        return run_daemon();
    }

    init_logging("rss_sentinel=warn");
    cli::run_cli(&cli_args)
}

/// Ensure only one process at a time can touch the adapters
pub fn acquire_instance_lock() -> Result<SingleInstance> {
    let instance = SingleInstance::new(APP_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to create single instance lock: {}", e))?;
    if !instance.is_single() {
        anyhow::bail!("Another instance of {} is already running", APP_NAME);
    }
    Ok(instance)
}

fn run_daemon() -> Result<()> {
    // Settings decide the log level, so the database opens before logging
    let db = Arc::new(Database::new()?);
    db.initialize()?;
    let settings = SettingsHandle::load(Arc::clone(&db))?;

    let snapshot = settings.snapshot();
    init_logging(if snapshot.settings.debug_logging {
        "rss_sentinel=debug"
    } else {
        "rss_sentinel=info"
    });
    info!("{} v{} starting...", APP_NAME, APP_VERSION);
    info!("Database at {:?}", Database::get_database_path());

    let _instance = match acquire_instance_lock() {
        Ok(instance) => instance,
        Err(e) => {
            error!("{}", e);
            return Err(e);
        }
    };

    match db.cleanup_history(snapshot.settings.history_retention_days) {
        Ok(0) => {}
        Ok(n) => info!("Pruned {} old history entries", n),
        Err(e) => warn!("History cleanup failed: {}", e),
    }

    let controller = platform::create_controller()?;
    let probe_host = SafeApplyTransaction::resolve_probe_host(controller.as_ref());
    let transaction = SafeApplyTransaction::new(controller, db.clone(), probe_host);

    // A crash between backup and commit leaves the old values pending
    match transaction.recover_pending() {
        Ok(true) => warn!("Restored configuration left by an interrupted transaction"),
        Ok(false) => {}
        Err(e) => error!("Crash recovery failed: {}", e),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_autopilot(db, settings, transaction))?;

    info!("{} shutting down", APP_NAME);
    Ok(())
}

async fn run_autopilot(
    db: Arc<Database>,
    settings: SettingsHandle,
    transaction: SafeApplyTransaction,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<StatusEvent>(STATUS_CHANNEL_CAPACITY);

    let history = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(state = %event.state, color = event.color, "{}", event.message);
            if let Err(e) = db.record_event(&event) {
                warn!("Failed to record mode history: {}", e);
            }
        }
    });

    let stop = StopSignal::new();
    let loop_stop = stop.clone();
    let mut autopilot = tokio::task::spawn_blocking(move || {
        let autopilot = Autopilot::new(
            transaction,
            Box::new(SysinfoProcessMonitor::new()),
            TopologyProbe::system(),
            settings,
            Box::new(tx),
        );
        autopilot.run(loop_stop);
    });

    let exited_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutdown requested");
            false
        }
        joined = &mut autopilot => {
            if let Err(e) = joined {
                error!("Autopilot thread failed: {}", e);
            }
            true
        }
    };

    if !exited_early {
        // The loop finishes any in-flight transaction before it sees this
        stop.trigger();
        if let Err(e) = autopilot.await {
            error!("Autopilot thread failed: {}", e);
        }
    }

    // Sender dropped with the loop, so the writer drains and exits
    if let Err(e) = history.await {
        error!("History writer failed: {}", e);
    }
    Ok(())
}

/// Initialize the logging system
fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
