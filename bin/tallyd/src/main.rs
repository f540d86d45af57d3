//! Tally daemon
//!
//! Hosts the counter service: loads configuration, opens the durable store,
//! runs the pipeline, reconciliation and consistency workers, and serves
//! `/metrics` and `/health` until interrupted.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tally_common::Config;
use tally_counters::{CounterService, LogNotifier, RedisCache};
use tally_store::RedbStore;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(about = "Tally counter service daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Durable store path (overrides store.path)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Redis URL of the counter cache (overrides cache.url)
    #[arg(long)]
    cache_url: Option<String>,

    /// Listen address for /metrics and /health (overrides server.listen)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        Config::load(args.config.as_deref()).context("failed to load configuration")?;

    // CLI takes precedence over the file and environment
    if let Some(path) = args.store_path {
        config.store.path = path;
    }
    if let Some(url) = args.cache_url {
        config.cache.url = url;
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.json = true;
    }

    init_logging(&config.logging.level, config.logging.json);

    info!("Starting Tally");
    if let Some(path) = &args.config {
        info!("Config file: {}", path.display());
    }

    let durable = Arc::new(
        RedbStore::open(&config.store.path)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?,
    );
    let cache = Arc::new(
        RedisCache::connect(&config.cache.url)
            .await
            .with_context(|| format!("failed to connect to cache at {}", config.cache.url))?,
    );
    let listen = config.server.listen.clone();

    let service = Arc::new(
        CounterService::new(config, cache, durable, Arc::new(LogNotifier))
            .await
            .context("failed to build counter service")?,
    );
    let tasks = service.start()?;

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&service));

    info!("Serving metrics on http://{}/metrics", addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await;
    if let Err(e) = &served {
        error!("HTTP server failed: {}", e);
    }

    tasks.shutdown().await;
    info!("Tally stopped");
    served.context("HTTP server failed")
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn metrics_handler(State(service): State<Arc<CounterService>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.metrics().export_prometheus(),
    )
}

async fn health_handler(State(service): State<Arc<CounterService>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "active_sagas": service.orchestrator().active_count(),
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}
