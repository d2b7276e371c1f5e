use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, StoreConfig, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::AdmissionEngine;
use tollgate::store::{MemoryStore, RateLimitStore};

/// Fixed-window admission control in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file; TOLLGATE__* environment variables override it
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Tollgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        max_requests = config.limits.max_requests,
        max_token_requests = config.limits.max_token_requests,
        window_secs = config.limits.window().as_secs(),
        block_duration_secs = config.limits.block_duration_secs,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;

    let mut engine = AdmissionEngine::new(store, config.limits.clone());
    if let Some(timeout) = config.store.timeout() {
        engine = engine.with_store_timeout(timeout);
    }
    info!("Admission engine initialized");

    let server = HttpServer::new(&config.server, Arc::new(engine))?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate admission service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn RateLimitStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(config.sweep_interval());
            Ok(store as Arc<dyn RateLimitStore>)
        }
        StoreBackend::Redis => connect_redis(config).await,
    }
}

#[cfg(feature = "redis-store")]
async fn connect_redis(config: &StoreConfig) -> anyhow::Result<Arc<dyn RateLimitStore>> {
    let store = tollgate::store::RedisStore::connect(&config.redis_url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn connect_redis(_config: &StoreConfig) -> anyhow::Result<Arc<dyn RateLimitStore>> {
    anyhow::bail!("the redis backend requires building with the `redis-store` feature")
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
