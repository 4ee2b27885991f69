//! Pool counters and point-in-time snapshots.
//!
//! [`PoolMetrics`] is a set of monotonic counters plus an "active jobs" gauge,
//! all plain atomics so reads never block the hot path. A pool owns an
//! `Arc<PoolMetrics>`; callers that want to observe several pools through one
//! set of counters can inject their own with `WorkerPool::with_metrics`.

use crate::lifecycle::PoolState;
use core::fmt;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use serde::Serialize;
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const MIB: f64 = 1024.0 * 1024.0;

/// Shared counters updated by the gateway and the workers.
#[derive(Debug)]
pub struct PoolMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    active: AtomicU64,
    started_at: Instant,
    memory: ProcessMemory,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            active: AtomicU64::new(0),
            started_at: Instant::now(),
            memory: ProcessMemory::new(),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Raises the active gauge until the returned guard is dropped.
    pub(crate) fn jobs_started(&self, count: u64) -> ActiveGuard<'_> {
        self.active.fetch_add(count, Ordering::Relaxed);
        ActiveGuard {
            metrics: self,
            count,
        }
    }

    /// Counts one finished job. Failures also count as completed.
    pub(crate) fn job_finished(&self, ok: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub(crate) fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        let uptime_seconds = self.uptime_seconds();
        let completed = self.completed();
        let jobs_per_sec = if uptime_seconds > 0.0 {
            completed as f64 / uptime_seconds
        } else {
            0.0
        };
        let runtime = tokio::runtime::Handle::try_current().ok();
        let memory = self.memory.sample();

        MetricsSnapshot {
            state: gauges.state,
            workers_alive: gauges.workers_alive,
            active_jobs: self.active(),
            queue_depth: gauges.queue_depth,
            queue_capacity: gauges.queue_capacity,
            submitted: self.submitted(),
            rejected: self.rejected(),
            completed,
            errors: self.errors(),
            uptime_seconds,
            jobs_per_sec,
            runtime_workers: runtime.as_ref().map(|rt| rt.metrics().num_workers()),
            runtime_alive_tasks: runtime.as_ref().map(|rt| rt.metrics().num_alive_tasks()),
            memory_rss_mb: memory.map(|(rss, _)| rss),
            memory_virtual_mb: memory.map(|(_, virt)| virt),
        }
    }
}

/// Reads this process's memory usage. Only our own pid is refreshed.
struct ProcessMemory {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemory {
    fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }

    /// Resident and virtual memory in MiB, if the platform exposes them.
    fn sample(&self) -> Option<(f64, f64)> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map(|process| {
            (
                process.memory() as f64 / MIB,
                process.virtual_memory() as f64 / MIB,
            )
        })
    }
}

impl fmt::Debug for ProcessMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemory")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Pool-owned gauges merged into a snapshot.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Gauges {
    pub(crate) state: PoolState,
    pub(crate) workers_alive: usize,
    pub(crate) queue_depth: usize,
    pub(crate) queue_capacity: usize,
}

pub(crate) struct ActiveGuard<'a> {
    metrics: &'a PoolMetrics,
    count: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(self.count, Ordering::Relaxed);
    }
}

/// A read-only aggregate of the pool's counters and gauges.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub state: PoolState,
    pub workers_alive: usize,
    pub active_jobs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub errors: u64,
    pub uptime_seconds: f64,
    pub jobs_per_sec: f64,
    /// Worker threads of the Tokio runtime the snapshot was taken on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_alive_tasks: Option<usize>,
    /// Resident set size of this process, in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_virtual_mb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauges() -> Gauges {
        Gauges {
            state: PoolState::Running,
            workers_alive: 2,
            queue_depth: 1,
            queue_capacity: 8,
        }
    }

    #[test]
    fn active_gauge_follows_guard() {
        let metrics = PoolMetrics::new();
        {
            let _guard = metrics.jobs_started(3);
            assert_eq!(metrics.active(), 3);
        }
        assert_eq!(metrics.active(), 0);
    }

    #[test]
    fn failures_count_as_completed_and_errors() {
        let metrics = PoolMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_rejected();
        metrics.job_finished(true);
        metrics.job_finished(false);

        let snapshot = metrics.snapshot(gauges());
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.workers_alive, 2);
        assert_eq!(snapshot.runtime_workers, None);
    }

    #[tokio::test]
    async fn snapshot_serializes_with_runtime_stats() {
        let metrics = PoolMetrics::new();
        let snapshot = metrics.snapshot(gauges());
        assert_eq!(snapshot.runtime_workers, Some(1));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["queue_capacity"], 8);
        assert!(json.get("runtime_alive_tasks").is_some());
        assert!(json["memory_rss_mb"].as_f64().is_some());
    }

    #[test]
    fn snapshot_reports_process_memory() {
        let snapshot = PoolMetrics::new().snapshot(gauges());
        let rss = snapshot.memory_rss_mb.unwrap();
        assert!(rss > 0.0);
        assert!(snapshot.memory_virtual_mb.unwrap() >= rss);
    }
}
