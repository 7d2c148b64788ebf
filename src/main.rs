//! teltonika-monitor - Teltonika router telemetry to Postgres
//!
//! Polls a Teltonika router over SSH at a fixed interval and stores the
//! reported modem values in Postgres, optionally as TimescaleDB hypertables.

mod config;
mod db;
mod error;
mod models;
mod teltonika;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Config};
use crate::db::PostgresDb;
use crate::teltonika::{TeltonikaRouter, TeltonikaSyncer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.log_directives() {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| config::DEFAULT_LOG_DIRECTIVES.into()),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    // Load configuration; nothing below runs without valid settings
    let settings = Config::load(&cli)?.into_settings()?;
    tracing::debug!("Configuration loaded: {:?}", settings);

    tracing::info!(
        "Connecting to postgres at: {}",
        config::redact_url(&settings.database_url)
    );
    let db = PostgresDb::connect(&settings.database_url).await?;

    let router = TeltonikaRouter::new(settings.target.clone());
    let syncer = TeltonikaSyncer::new(router, db.clone(), settings.interval);
    syncer.prepare(settings.hypertables).await?;

    let summary = syncer.run(shutdown_signal()).await;
    db.close().await;

    tracing::info!(
        "Shut down cleanly ({} cycles, {} failed)",
        summary.cycles,
        summary.failed
    );
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
