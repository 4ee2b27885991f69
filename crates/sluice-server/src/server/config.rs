use anyhow::{Context, bail};
use crate::server::service::handler::HttpLimits;
use clap::{ArgAction, Parser};
use core::num::NonZeroU32;
use core::time::Duration;
use sluice::{
    AdaptiveConfig, Backpressure, CircuitBreakerConfig, DrainPolicy, PoolConfig, QueueDiscipline,
    RateLimitConfig, default_workers,
};

/// Runtime configuration for the `sluice-server` binary.
///
/// These settings size the worker pool behind every HTTP request and select
/// which admission policies guard it. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is loaded first), with
/// defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sluice-server",
    version,
    about = "An HTTP server that dispatches requests through a bounded worker pool"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Number of worker tasks. Defaults to two per logical CPU.
    ///
    /// Environment variable: `WORKERS`
    #[arg(long, env = "WORKERS", default_value_t = default_workers())]
    pub workers: usize,

    /// Jobs that may wait for a worker before requests are turned away with
    /// `503 Service Unavailable`.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 10_000)]
    pub queue_capacity: usize,

    /// How long a request waits for its job before answering
    /// `408 Request Timeout`.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Requests handled at once across all connections. Further requests wait
    /// for a slot.
    ///
    /// Environment variable: `MAX_CONNECTIONS`
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 100_000)]
    pub max_connections: usize,

    /// Seconds allowed to receive a request body.
    ///
    /// Environment variable: `READ_TIMEOUT_SECS`
    #[arg(long, env = "READ_TIMEOUT_SECS", default_value_t = 15)]
    pub read_timeout_secs: u64,

    /// Upper bound on a graceful pool shutdown; workers still busy afterwards
    /// are aborted.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Simulated processing time per request.
    ///
    /// Environment variable: `WORK_DELAY_MS`
    #[arg(long, env = "WORK_DELAY_MS", default_value_t = 100)]
    pub work_delay_ms: u64,

    /// Order queued jobs by the `X-Priority` request header instead of
    /// arrival.
    ///
    /// Environment variable: `PRIORITY_QUEUE`
    #[arg(long, env = "PRIORITY_QUEUE", default_value_t = false)]
    pub priority_queue: bool,

    /// Finish queued jobs on shutdown. When `false`, queued jobs are answered
    /// with `503` and only in-flight jobs complete.
    ///
    /// Environment variable: `DRAIN_ON_SHUTDOWN`
    #[arg(long, env = "DRAIN_ON_SHUTDOWN", default_value_t = true, action = ArgAction::Set)]
    pub drain_on_shutdown: bool,

    /// Hold requests until queue space frees up instead of rejecting them.
    ///
    /// Environment variable: `BLOCK_WHEN_FULL`
    #[arg(long, env = "BLOCK_WHEN_FULL", default_value_t = false)]
    pub block_when_full: bool,

    /// Jobs started per second across all workers. Unlimited when unset.
    ///
    /// Environment variable: `RATE_LIMIT_PER_SEC`
    #[arg(long, env = "RATE_LIMIT_PER_SEC")]
    pub rate_limit_per_sec: Option<u32>,

    /// Token bucket size. Defaults to `RATE_LIMIT_PER_SEC`.
    ///
    /// Environment variable: `RATE_LIMIT_BURST`
    #[arg(long, env = "RATE_LIMIT_BURST", requires = "rate_limit_per_sec")]
    pub rate_limit_burst: Option<u32>,

    /// Consecutive job failures that open the circuit breaker. Disabled when
    /// unset.
    ///
    /// Environment variable: `BREAKER_MAX_FAILURES`
    #[arg(long, env = "BREAKER_MAX_FAILURES")]
    pub breaker_max_failures: Option<u32>,

    /// Seconds the circuit stays open before admitting a trial job.
    ///
    /// Environment variable: `BREAKER_RESET_SECS`
    #[arg(long, env = "BREAKER_RESET_SECS", default_value_t = 30)]
    pub breaker_reset_secs: u64,

    /// Lower bound for adaptive sizing. Set together with
    /// `ADAPTIVE_MAX_WORKERS`.
    ///
    /// Environment variable: `ADAPTIVE_MIN_WORKERS`
    #[arg(long, env = "ADAPTIVE_MIN_WORKERS")]
    pub adaptive_min_workers: Option<usize>,

    /// Upper bound for adaptive sizing.
    ///
    /// Environment variable: `ADAPTIVE_MAX_WORKERS`
    #[arg(long, env = "ADAPTIVE_MAX_WORKERS")]
    pub adaptive_max_workers: Option<usize>,

    /// Log a metrics line periodically.
    ///
    /// Environment variable: `ENABLE_METRICS`
    #[arg(long, env = "ENABLE_METRICS", default_value_t = true, action = ArgAction::Set)]
    pub enable_metrics: bool,

    /// Seconds between metrics lines.
    ///
    /// Environment variable: `METRICS_INTERVAL_SECS`
    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value_t = 5)]
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub pool: PoolConfig,
    pub request_timeout: Duration,
    pub limits: HttpLimits,
    pub work_delay: Duration,
    pub enable_metrics: bool,
    pub metrics_interval: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            bail!("WORKERS must be greater than 0");
        }
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }
        if args.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }
        if args.max_connections == 0 {
            bail!("MAX_CONNECTIONS must be greater than 0");
        }
        if args.read_timeout_secs == 0 {
            bail!("READ_TIMEOUT_SECS must be greater than 0");
        }
        if args.enable_metrics && args.metrics_interval_secs == 0 {
            bail!("METRICS_INTERVAL_SECS must be greater than 0");
        }

        let mut pool = PoolConfig::new(args.workers)
            .with_queue_capacity(args.queue_capacity)
            .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs));

        if args.priority_queue {
            pool = pool.with_discipline(QueueDiscipline::Priority);
        }
        if !args.drain_on_shutdown {
            pool = pool.with_drain(DrainPolicy::StopImmediately);
        }
        if args.block_when_full {
            pool = pool.with_backpressure(Backpressure::Block);
        }

        if let Some(per_second) = args.rate_limit_per_sec {
            let per_second =
                NonZeroU32::new(per_second).context("RATE_LIMIT_PER_SEC must be greater than 0")?;
            let mut limit = RateLimitConfig::per_second(per_second);
            if let Some(burst) = args.rate_limit_burst {
                let burst =
                    NonZeroU32::new(burst).context("RATE_LIMIT_BURST must be greater than 0")?;
                limit = limit.with_burst(burst);
            }
            pool = pool.with_rate_limit(limit);
        }

        if let Some(max_failures) = args.breaker_max_failures {
            pool = pool.with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_max_failures(max_failures)
                    .with_reset_timeout(Duration::from_secs(args.breaker_reset_secs)),
            );
        }

        match (args.adaptive_min_workers, args.adaptive_max_workers) {
            (Some(min), Some(max)) => {
                if min > max {
                    bail!(
                        "ADAPTIVE_MIN_WORKERS ({}) exceeds ADAPTIVE_MAX_WORKERS ({})",
                        min,
                        max
                    );
                }
                // Start inside the adaptive range.
                pool = pool
                    .with_workers(args.workers.clamp(min, max))
                    .with_adaptive(AdaptiveConfig::new(min, max));
            }
            (None, None) => {}
            _ => bail!("ADAPTIVE_MIN_WORKERS and ADAPTIVE_MAX_WORKERS must be set together"),
        }

        pool.validate()?;

        Ok(Self {
            server_addr: args.server_addr,
            pool,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            limits: HttpLimits {
                max_connections: args.max_connections,
                read_timeout: Duration::from_secs(args.read_timeout_secs),
            },
            work_delay: Duration::from_millis(args.work_delay_ms),
            enable_metrics: args.enable_metrics,
            metrics_interval: Duration::from_secs(args.metrics_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(core::iter::once("sluice-server").chain(args.iter().copied()))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn defaults_build_a_plain_pool() {
        let config = parse(&["--workers", "4"]).unwrap();
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.queue_capacity, 10_000);
        assert_eq!(config.pool.discipline, QueueDiscipline::Fifo);
        assert_eq!(config.pool.drain, DrainPolicy::Drain);
        assert_eq!(config.pool.backpressure, Backpressure::Reject);
        assert_eq!(config.pool.rate_limit, None);
        assert_eq!(config.pool.circuit_breaker, None);
        assert_eq!(config.pool.adaptive, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.work_delay, Duration::from_millis(100));
        assert_eq!(config.limits, HttpLimits::default());
    }

    #[test]
    fn http_limits_come_from_flags() {
        let config = parse(&["--max-connections", "64", "--read-timeout-secs", "3"]).unwrap();
        assert_eq!(config.limits.max_connections, 64);
        assert_eq!(config.limits.read_timeout, Duration::from_secs(3));
    }

    #[test]
    fn policies_are_switched_on_by_flags() {
        let config = parse(&[
            "--workers",
            "2",
            "--priority-queue",
            "--block-when-full",
            "--drain-on-shutdown",
            "false",
            "--rate-limit-per-sec",
            "50",
            "--rate-limit-burst",
            "5",
            "--breaker-max-failures",
            "3",
            "--breaker-reset-secs",
            "10",
        ])
        .unwrap();

        assert_eq!(config.pool.discipline, QueueDiscipline::Priority);
        assert_eq!(config.pool.backpressure, Backpressure::Block);
        assert_eq!(config.pool.drain, DrainPolicy::StopImmediately);

        let limit = config.pool.rate_limit.unwrap();
        assert_eq!(limit.per_second.get(), 50);
        assert_eq!(limit.burst.get(), 5);

        let breaker = config.pool.circuit_breaker.unwrap();
        assert_eq!(breaker.max_failures, 3);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(10));
    }

    #[test]
    fn adaptive_bounds_clamp_the_initial_workers() {
        let config = parse(&[
            "--workers",
            "64",
            "--adaptive-min-workers",
            "2",
            "--adaptive-max-workers",
            "8",
        ])
        .unwrap();
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.adaptive, Some(AdaptiveConfig::new(2, 8)));
    }

    #[test]
    fn rejects_inconsistent_settings() {
        assert!(parse(&["--workers", "0"]).is_err());
        assert!(parse(&["--queue-capacity", "0"]).is_err());
        assert!(parse(&["--request-timeout-ms", "0"]).is_err());
        assert!(parse(&["--max-connections", "0"]).is_err());
        assert!(parse(&["--read-timeout-secs", "0"]).is_err());
        assert!(parse(&["--rate-limit-per-sec", "0"]).is_err());
        assert!(parse(&["--adaptive-min-workers", "2"]).is_err());
        assert!(
            parse(&[
                "--adaptive-min-workers",
                "8",
                "--adaptive-max-workers",
                "2"
            ])
            .is_err()
        );
        assert!(parse(&["--breaker-max-failures", "0"]).is_err());
    }
}
