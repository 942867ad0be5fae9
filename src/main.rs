//! OwnTracks Recorder - location ingestion and enrichment worker
//!
//! Consumes OwnTracks location reports from NATS JetStream, stores them in
//! PostgreSQL/PostGIS and enriches stored points with reverse-geocoded
//! place names.

mod cli;
mod config;
mod db;
mod defaults;
mod handlers;
mod services;
mod types;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| defaults::LOGS_DIR.to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, defaults::LOG_FILE);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let (stdout_text, stdout_json) = if json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    let (file_text, file_json) = if json {
        (None, Some(fmt::layer().json().with_writer(non_blocking).with_ansi(false)))
    } else {
        (Some(fmt::layer().with_writer(non_blocking).with_ansi(false)), None)
    };

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| defaults::LOG_FILTER.into()),
        ))
        .with(stdout_text)
        .with(stdout_json)
        .with(file_text)
        .with(file_json)
        .init();

    let cli = Cli::parse();

    info!("Starting OwnTracks Recorder...");

    // Load configuration
    let config = config::Config::from_env()?;
    info!("Configuration loaded");

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    info!("Connected to PostgreSQL");

    db::run_migrations(&pool).await?;

    if matches!(cli.command, Some(Command::Migrate)) {
        pool.close().await;
        return Ok(());
    }

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth)
    let nats_client = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) => {
            async_nats::ConnectOptions::new()
                .user_and_password(user.clone(), password.clone())
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let result = handlers::start_pipeline(nats_client, pool.clone(), &config, shutdown).await;
    pool.close().await;

    if let Err(e) = result {
        error!("Pipeline error: {}", e);
        return Err(e);
    }

    info!("OwnTracks Recorder stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
