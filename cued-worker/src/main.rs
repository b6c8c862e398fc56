//! Cued worker - main entry point
//!
//! Runs the continuity engine and its HTTP surface:
//! - Resolves configuration (CLI > `CUED_*` env > TOML > defaults)
//! - Opens the SQLite database and evicts sessions left by a previous run
//! - Starts the worker pool and serves toggle/status/health

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cued_common::config::{resolve_config, CuedConfig};
use cued_common::events::EventBus;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use cued_worker::credentials::{CredentialLifecycle, SpotifyTokenClient};
use cued_worker::cues::CueResolver;
use cued_worker::db::{SqliteCredentialStore, SqliteCueStore, SqliteJobQueue};
use cued_worker::playback::SpotifyClient;
use cued_worker::registry::{SessionRegistry, SessionSettings, WorkerPool};
use cued_worker::scheduler::SessionEnvironment;
use cued_worker::{build_router, AppState};

/// Command-line arguments for cued-worker
#[derive(Parser, Debug)]
#[command(name = "cued-worker")]
#[command(about = "Cue-point continuity engine for remote playback sessions")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "CUED_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// SQLite database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Number of concurrent session workers
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut CuedConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(database) = &self.database {
            config.database_path = Some(database.clone());
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.poll_interval_ms = poll_interval_ms;
        }
        if let Some(workers) = self.workers {
            config.worker_concurrency = workers;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("cued_worker={level},cued_common={level},tower_http={level}").into()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default filter until the configured level is known
    let (filter, filter_handle) = reload::Layer::new(log_filter("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = resolve_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    filter_handle
        .modify(|filter| *filter = log_filter(&config.logging.level))
        .context("Failed to apply log level")?;

    info!("Starting cued-worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        poll_interval_ms = config.poll_interval_ms,
        total_runs = config.total_runs,
        refresh_cooldown_ms = config.refresh_cooldown_ms,
        safety_margin_multiplier = config.safety_margin_multiplier,
        worker_concurrency = config.worker_concurrency,
        "Session settings"
    );

    let client_id = config
        .spotify
        .client_id
        .clone()
        .context("spotify.client_id is required (set CUED_SPOTIFY_CLIENT_ID)")?;

    let db_path = config.resolved_database_path();
    info!("Database: {}", db_path.display());
    let db_pool = cued_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let instance_id = Uuid::new_v4();
    info!(instance_id = %instance_id, "Process instance");

    let event_bus = EventBus::new(1000);

    let playback = SpotifyClient::new(&config.spotify.api_base_url, config.request_timeout())
        .context("Failed to build playback client")?;
    let token_client =
        SpotifyTokenClient::new(&config.spotify.token_url, client_id, config.request_timeout())
            .context("Failed to build token client")?;

    let env = SessionEnvironment {
        credentials: CredentialLifecycle::new(
            Arc::new(SqliteCredentialStore::new(db_pool.clone())),
            Arc::new(token_client),
            config.refresh_cooldown(),
            event_bus.clone(),
        ),
        playback: Arc::new(playback),
        cues: CueResolver::new(Arc::new(SqliteCueStore::new(db_pool.clone()))),
        queue: Arc::new(SqliteJobQueue::new(db_pool.clone(), instance_id)),
        event_bus: event_bus.clone(),
    };

    let pool = WorkerPool::spawn(config.worker_concurrency);
    let registry = SessionRegistry::new(env, SessionSettings::from(&config), pool);

    registry
        .evict_orphans()
        .await
        .context("Failed to evict orphaned sessions")?;

    let app = build_router(AppState::new(registry.clone(), event_bus));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server stopped, cancelling sessions");
    registry.shutdown().await;
    db_pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
