use crate::server::service::handler::{AppState, ServerStats};
use core::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Logs a one-line stats summary every `interval` until the server starts
/// shutting down.
pub async fn report_metrics(state: AppState, interval: Duration) {
    let token = state.shutdown_token().clone();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let _line = metrics_line(&state.stats());
                #[cfg(feature = "tracing")]
                tracing::info!("METRICS: {_line}");
            }
        }
    }
}

fn metrics_line(stats: &ServerStats) -> String {
    let mem = stats
        .pool
        .memory_rss_mb
        .map_or_else(|| "n/a".to_owned(), |mb| format!("{mb:.0}MB"));
    format!(
        "active={}, total={}, completed={}, errors={}, jobs/s={:.2}, queued={}/{}, workers={}, mem={}",
        stats.requests.active_connections,
        stats.requests.total_requests,
        stats.requests.completed_requests,
        stats.requests.error_count,
        stats.pool.jobs_per_sec,
        stats.pool.queue_depth,
        stats.pool.queue_capacity,
        stats.pool.workers_alive,
        mem,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::work::simulated_work;
    use sluice::{PoolConfig, WorkerPool};
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn stops_with_the_server() {
        let pool = WorkerPool::new(PoolConfig::new(1), simulated_work(Duration::ZERO)).unwrap();
        let token = CancellationToken::new();
        let state = AppState::new(pool, Duration::from_secs(1), token.clone());

        let reporter = tokio::spawn(report_metrics(state, Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!reporter.is_finished());

        token.cancel();
        reporter.await.unwrap();
    }

    #[tokio::test]
    async fn line_includes_process_memory() {
        let pool = WorkerPool::new(PoolConfig::new(2), simulated_work(Duration::ZERO)).unwrap();
        let state = AppState::new(pool, Duration::from_secs(1), CancellationToken::new());

        let mut stats = state.stats();
        let line = metrics_line(&stats);
        assert!(line.contains("workers=2"), "{line}");
        assert!(line.ends_with("MB"), "{line}");

        stats.pool.memory_rss_mb = Some(42.4);
        assert!(metrics_line(&stats).ends_with("mem=42MB"));
        stats.pool.memory_rss_mb = None;
        assert!(metrics_line(&stats).ends_with("mem=n/a"));
    }
}
