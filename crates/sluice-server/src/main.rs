#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::reporter::report_metrics;
use server::service::handler::{AppState, router};
use server::service::work::simulated_work;
use server::telemetry::init_telemetry;
use sluice::WorkerPool;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let pool = WorkerPool::new(config.pool.clone(), simulated_work(config.work_delay))?;
    let shutdown = CancellationToken::new();
    let state = AppState::new(pool.clone(), config.request_timeout, shutdown.clone())
        .with_limits(config.limits);

    let reporter = config
        .enable_metrics
        .then(|| tokio::spawn(report_metrics(state.clone(), config.metrics_interval)));

    // === Phase 1: serve until a signal, then let in-flight requests finish ===
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // === Phase 2: stop the pool ===
    let _report = pool.shutdown().await;
    #[cfg(feature = "tracing")]
    if _report.is_clean() {
        tracing::info!("Worker pool stopped cleanly");
    } else {
        tracing::warn!(
            "Worker pool stopped with {} aborted workers and {} abandoned jobs",
            _report.outstanding.len(),
            _report.abandoned_jobs
        );
    }

    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    // === Phase 3: flush telemetry ===
    providers.shutdown();

    #[cfg(feature = "tracing")]
    tracing::info!("Server stopped gracefully");
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting server on {} with full config: {:#?}",
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting server on {} with {} workers, queue capacity {}",
            _config.server_addr,
            _config.pool.workers,
            _config.pool.queue_capacity
        );
    }
}

/// Resolves on Ctrl+C or SIGTERM and cancels `shutdown`, which also ends
/// open `/sse/metrics` streams and the metrics reporter.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    shutdown.cancel();
}
