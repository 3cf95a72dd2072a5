//! Pipeline Runtime
//!
//! Runs the ingestion + scoring scheduler until CTRL+C:
//! - Applies SQLite schema migrations
//! - Builds adapters (synthetic or live), signal engine and alert dispatcher
//! - Drives one cycle per interval; CTRL+C stops new submissions, lets
//!   in-flight tasks finish and settles the cycle
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime            # loop
//!   cargo run --release --bin pipeline_runtime -- --once  # single cycle
//!
//! Configuration comes from the environment (and `.env`), see
//! `PipelineConfig::from_env` for the full list.

use dotenv::dotenv;
use log::{error, info, warn};
use riskflow::pipeline::{
    adapters::AdapterRegistry,
    alerts::dispatcher_from_config,
    config::{AdapterMode, PipelineConfig},
    db::{run_schema_migrations, SqliteStore, StoreOptions, TimeSeriesStore},
    engine::SignalEngine,
    scheduler::{Scheduler, SchedulerHandle, SchedulerSettings},
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let run_once = std::env::args().any(|arg| arg == "--once");

    info!("🚀 riskflow pipeline runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: {}", if run_once { "single cycle" } else { "scheduled" });

    let config = PipelineConfig::from_env()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Pairs: {}", config.pairs.len());
    info!("   ├─ Cycle interval: {}s", config.cycle_interval.as_secs());
    info!("   ├─ Max in flight: {}", config.max_in_flight);
    info!(
        "   ├─ Weights: {}",
        config
            .weights
            .iter()
            .map(|(kind, w)| format!("{}={}", kind, w))
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("   ├─ Profile: {}", config.signal_profile);
    info!(
        "   ├─ Adapters: {}",
        match config.adapter_mode {
            AdapterMode::Mock => "synthetic",
            AdapterMode::Live => "live (Binance/Bybit/CryptoPanic)",
        }
    );
    info!(
        "   └─ Alerts: {}",
        if config.telegram.is_some() { "Telegram" } else { "disabled" }
    );

    info!("🔧 Initializing database...");
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store: Arc<dyn TimeSeriesStore> = Arc::new(SqliteStore::open(
        &config.db_path,
        StoreOptions {
            op_timeout: config.store_timeout,
            retry_attempts: config.store_retry_attempts,
            retry_base: config.store_retry_base,
        },
    )?);
    info!("✅ Database initialized");

    let engine = Arc::new(SignalEngine::from_config(store.clone(), &config)?);
    let registry = AdapterRegistry::from_config(&config);
    let dispatcher = dispatcher_from_config(config.telegram.clone());

    let scheduler = Arc::new(Scheduler::new(
        registry,
        store,
        engine,
        dispatcher,
        SchedulerSettings::from_config(&config),
    ));
    let (handle, signals) = SchedulerHandle::new();

    if run_once {
        let report = scheduler.run_cycle(chrono::Utc::now(), handle.cancel_receiver()).await;
        info!(
            "✅ Cycle finished: {}/{} tasks ok, {} signals, {} headlines",
            report.succeeded, report.attempted, report.signals_written, report.headlines_written
        );
        for failure in &report.failures {
            warn!("   └─ {}", failure);
        }
        if let Some(e) = &report.headline_error {
            warn!("   └─ headlines: {}", e);
        }
        return Ok(());
    }

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(signals).await })
    };

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, finishing in-flight tasks...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    handle.cancel();
    if let Err(e) = runner.await {
        error!("❌ Scheduler task failed: {}", e);
    }

    let health = scheduler.health().snapshot().await;
    info!("📊 Last cycle:");
    info!(
        "   ├─ At: {}",
        health
            .last_cycle_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    info!("   └─ Failed tasks: {}", health.failed_tasks);
    info!("✅ Pipeline runtime stopped");
    Ok(())
}
