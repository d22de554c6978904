//! obligationd - runs the obligation lifecycle and escalation engine
//!
//! The daemon:
//! - loads layered configuration (defaults, file, environment)
//! - seeds an in-memory store from a JSON file
//! - runs the engine until Ctrl+C or SIGTERM
//! - logs engine counters once per reconciliation interval

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use obligation_engine::{Engine, EngineHandle, InMemoryStore, TracingNotifier};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod seed;

use crate::config::DaemonConfig;
use crate::error::DaemonResult;

/// obligationd CLI
#[derive(Parser)]
#[command(name = "obligationd")]
#[command(about = "Obligation lifecycle and escalation engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OBLIGATIONS_CONFIG")]
    config: Option<String>,

    /// JSON file of obligations to load at startup
    #[arg(short, long, env = "OBLIGATIONS_SEED")]
    seed: Option<String>,

    /// Log level
    #[arg(long, env = "OBLIGATIONS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "OBLIGATIONS_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    init_tracing(&config);

    run(config).await.context("obligationd failed")
}

async fn run(config: DaemonConfig) -> DaemonResult<()> {
    config.engine.validate()?;

    let drafter = config.drafter.build(config.engine.call_timeout())?;
    info!(kind = ?config.drafter.kind, "Drafter configured");

    let store = InMemoryStore::new();
    let engine = Engine::builder(Arc::new(store.clone()))
        .notifier(Arc::new(TracingNotifier))
        .drafter(drafter)
        .config(config.engine.clone())
        .start()?;

    if let Some(path) = config.seed.as_deref() {
        let obligations = seed::load(path, chrono::Utc::now()).await?;
        for obligation in seed::populate(&store, obligations).await {
            engine.on_obligation_created(obligation).await?;
        }
    }

    let stats_task = tokio::spawn(log_stats(engine.clone(), config.engine.reconciliation_interval()));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        reminder_threshold_secs = config.engine.reminder_threshold_secs,
        escalation_threshold_secs = config.engine.escalation_threshold_secs,
        "obligationd running"
    );

    shutdown_signal().await;

    stats_task.abort();
    engine.shutdown().await?;
    info!("obligationd stopped");
    Ok(())
}

fn init_tracing(config: &DaemonConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn log_stats(engine: EngineHandle, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        match engine.stats().await {
            Ok(stats) => info!(
                evaluated = stats.evaluated,
                transitioned = stats.transitioned,
                delivered = stats.delivered,
                deduplicated = stats.deduplicated,
                deferred = stats.deferred,
                held_for_review = stats.held_for_review,
                inconsistent = stats.inconsistent,
                failures = stats.failures,
                queue_len = stats.queue_len,
                in_flight = stats.in_flight,
                "Engine stats"
            ),
            Err(e) => {
                warn!(error = %e, "Engine stats unavailable");
                return;
            }
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
