//! cdm-etl - clinical ingestion to standardized model service
//!
//! Serves the ingestion, prediction, normalization, review and persistence
//! API over HTTP, with pipeline events on SSE.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdm_common::config::{default_config_path, load_toml_config, resolve_root_folder};
use cdm_common::events::EventBus;
use cdm_etl::{config, db, AppState};

/// Command-line arguments for cdm-etl
#[derive(Parser, Debug)]
#[command(name = "cdm-etl")]
#[command(about = "Clinical ingestion to standardized data model pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5780", env = "CDM_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "CDM_BIND")]
    bind: std::net::IpAddr,

    /// Folder holding the SQLite database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, env = "CDM_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let toml_config = match &config_path {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Default::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cdm-etl v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path = root_folder.join(db::DATABASE_FILE);
    info!("Database: {}", db_path.display());

    let db_pool = db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let api_key = config::resolve_reasoning_api_key(&db_pool, &toml_config).await?;
    let embedder = config::build_embedder(&toml_config);
    let reasoning = config::build_reasoning_registry(&toml_config, api_key);
    if reasoning.names().is_empty() {
        warn!("No reasoning backend configured; reasoning tier disabled");
    }

    let event_bus = EventBus::new(256);
    let state = AppState::new(db_pool, event_bus, &toml_config, embedder, reasoning);
    let app = cdm_etl::build_router(state);

    let addr = SocketAddr::from((args.bind, args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
