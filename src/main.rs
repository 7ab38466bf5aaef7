//! Passthrough Relay - Main entry point
//!
//! Connects to the channel/token database, wires the relay services and
//! serves the HTTP API.

use anyhow::Result;
use passthrough_relay::{
    api::{build_router, AppState, Backends},
    core::{init_metrics, init_tracing, AppConfig, Database, DatabaseConfig, PgStore},
    core::tokenizer::TiktokenEstimator,
    services::ThreadRandom,
};
use std::net::SocketAddr;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config = AppConfig::from_env()?;

    let db_url = std::env::var("DB_URL")
        .map_err(|_| anyhow::anyhow!("DB_URL environment variable is required"))?;
    let db_config = DatabaseConfig::from_url(&db_url);
    tracing::info!("Connecting to database...");
    let db = Database::connect(&db_config).await?;
    tracing::info!("Database connected successfully");

    if !db.check_migrations().await? {
        return Err(anyhow::anyhow!(
            "Database schema not found. Apply the SQL files under migrations/ first."
        ));
    }

    let store = Arc::new(PgStore::new(db.pool().clone(), config.auto_disable_channel));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let relay_path = config.relay_path.clone();
    tracing::info!(
        retry_times = config.retry_times,
        capability_tag = %config.capability_tag,
        rate_limited = config.model_request_rate_limit.is_some(),
        "Configuration loaded"
    );

    let state = AppState::new(
        config,
        Backends::from_store(store),
        Arc::new(TiktokenEstimator),
        Arc::new(ThreadRandom),
    )?;
    let app = build_router(state);

    tracing::info!("Starting passthrough relay on {}", addr);
    tracing::info!("Relay endpoint: POST {}", relay_path);
    tracing::info!("Usage API: /usage/api/balance, /usage/api/get-models");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 && period > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}
