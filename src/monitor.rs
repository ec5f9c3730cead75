// ABOUTME: Background health sweep and read-only statistics for one pool
//
// The monitor periodically classifies workers as unhealthy or long-idle and
// logs aggregate counts. It never removes anything — removal stays with the
// pool's explicit cleanup calls so policy decisions live in one place.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::worker::{SharedWorkers, Worker};

/// How long `stop()` waits for the sweep task to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregate statistics for one pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total workers in the pool
    pub total_workers: usize,
    /// Workers currently held by callers
    pub busy_workers: usize,
    /// Workers not currently held
    pub idle_workers: usize,
    /// Workers whose process is alive and undisposed
    pub healthy_workers: usize,
    /// Workers whose process has exited or that were disposed
    pub unhealthy_workers: usize,
    /// Sum of request counts across all workers
    pub total_requests: u64,
    /// Mean uptime across all workers
    pub average_uptime: Duration,
}

/// Read-only snapshot of one worker for external telemetry
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// Generated worker id
    pub worker_id: String,
    /// OS process id
    pub process_id: u32,
    /// Whether a caller currently holds the worker
    pub is_busy: bool,
    /// Whether the process is alive and the worker undisposed
    pub is_healthy: bool,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Wall-clock time of the last successful acquire
    pub last_used_at: DateTime<Utc>,
    /// Successful acquires over the worker's lifetime
    pub request_count: u64,
    /// Duration since creation
    pub uptime: Duration,
    /// Duration since last use
    pub idle_time: Duration,
}

impl ProcessInfo {
    fn snapshot(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id().to_string(),
            process_id: worker.pid(),
            is_busy: worker.is_busy(),
            is_healthy: worker.is_healthy(),
            created_at: worker.created_at(),
            last_used_at: worker.last_used_at(),
            request_count: worker.request_count(),
            uptime: worker.uptime(),
            idle_time: worker.idle_time(),
        }
    }
}

/// Result of classifying the worker set during one sweep
#[derive(Debug, Default)]
pub(crate) struct SweepReport {
    pub unhealthy: Vec<String>,
    pub long_idle: Vec<String>,
    pub total: usize,
}

/// Passive periodic observer of one pool's worker set
pub struct Monitor {
    workers: SharedWorkers,
    settings: PoolSettings,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub(crate) fn new(workers: SharedWorkers, settings: PoolSettings) -> Self {
        Self {
            workers,
            settings,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the recurring sweep task. Calling twice is a no-op.
    pub(crate) fn start(&self) {
        let Ok(mut slot) = self.handle.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let workers = self.workers.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            Self::sweep_loop(workers, &settings, shutdown).await;
        }));

        info!(
            interval_ms = u64::try_from(self.settings.health_check_interval.as_millis())
                .unwrap_or(u64::MAX),
            "pool monitor started"
        );
    }

    /// Stop the sweep task, waiting briefly for it to finish
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }

        debug!("pool monitor stopped");
    }

    /// Cancel the sweep task without waiting; used from `Drop`
    pub(crate) fn cancel(&self) {
        self.shutdown.cancel();
    }

    async fn sweep_loop(
        workers: SharedWorkers,
        settings: &PoolSettings,
        shutdown: CancellationToken,
    ) {
        debug!("monitor sweep loop started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(settings.health_check_interval) => {}
            }

            let snapshot: Vec<std::sync::Arc<Worker>> =
                workers.read().await.values().cloned().collect();
            let report = Self::classify(&snapshot, settings.worker_idle_timeout);

            for id in &report.unhealthy {
                warn!(worker = %id, "sweep found unhealthy worker");
            }
            for id in &report.long_idle {
                debug!(worker = %id, "sweep found long-idle worker");
            }

            if !report.unhealthy.is_empty() || !report.long_idle.is_empty() {
                info!(
                    unhealthy = report.unhealthy.len(),
                    long_idle = report.long_idle.len(),
                    total = report.total,
                    "worker sweep report"
                );
            }
        }

        debug!("monitor sweep loop ended");
    }

    /// Classify a worker snapshot into unhealthy and long-idle-not-busy sets
    pub(crate) fn classify(
        workers: &[std::sync::Arc<Worker>],
        idle_timeout: Duration,
    ) -> SweepReport {
        let mut report = SweepReport {
            total: workers.len(),
            ..SweepReport::default()
        };

        for worker in workers {
            if !worker.is_healthy() {
                report.unhealthy.push(worker.id().to_string());
            } else if !worker.is_busy() && worker.idle_time() > idle_timeout {
                report.long_idle.push(worker.id().to_string());
            }
        }

        report
    }

    /// Aggregate statistics over the current worker set
    pub async fn get_stats(&self) -> PoolStats {
        let workers = self.workers.read().await;

        let total = workers.len();
        let busy = workers.values().filter(|w| w.is_busy()).count();
        let healthy = workers.values().filter(|w| w.is_healthy()).count();
        let total_requests: u64 = workers.values().map(|w| w.request_count()).sum();

        let average_uptime = if total > 0 {
            workers.values().map(|w| w.uptime()).sum::<Duration>()
                / u32::try_from(total).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        };

        PoolStats {
            total_workers: total,
            busy_workers: busy,
            idle_workers: total - busy,
            healthy_workers: healthy,
            unhealthy_workers: total - healthy,
            total_requests,
            average_uptime,
        }
    }

    /// Snapshot of one worker, `None` if the id is unknown
    pub async fn get_process_info(&self, worker_id: &str) -> Option<ProcessInfo> {
        let workers = self.workers.read().await;
        workers.get(worker_id).map(|w| ProcessInfo::snapshot(w))
    }

    /// Snapshots of every worker in the pool
    pub async fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        let workers = self.workers.read().await;
        workers.values().map(|w| ProcessInfo::snapshot(w)).collect()
    }
}
