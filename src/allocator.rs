// ABOUTME: Worker selection and load-balance advice for one pool
//
// Picks a reusable idle worker (fewest requests first, then shortest idle
// time), decides whether a new worker may be created, and computes scaling
// recommendations from current load and health ratios.

use std::time::{Duration, Instant};

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolSettings;
use crate::error::{PoolError, PoolResult};
use crate::worker::{SharedWorkers, Worker};

/// Outcome of asking the allocator for a worker
#[derive(Debug)]
pub enum Allocation {
    /// An existing idle worker was acquired for the caller
    Acquired(Arc<Worker>),

    /// No idle worker exists, but the pool has capacity for a new one
    SpawnNeeded,

    /// The wait expired with the pool at capacity and nothing free
    Exhausted,
}

/// Advisory scaling classification derived from load and health ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadBalanceRecommendation {
    /// Pool is operating normally
    MaintainCurrent,
    /// Load is high and capacity remains
    CreateMoreWorkers,
    /// Load is low and the pool is above its minimum
    ReduceWorkers,
    /// Too many unhealthy workers; reap them first
    CleanupUnhealthy,
}

/// Snapshot of pool load for external monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalanceInfo {
    /// Total workers in the pool
    pub total_workers: usize,
    /// Workers currently held by callers
    pub busy_workers: usize,
    /// Workers not currently held
    pub idle_workers: usize,
    /// Workers whose process is alive and undisposed
    pub healthy_workers: usize,
    /// busy / total, 0 when the pool is empty
    pub load_percentage: f64,
    /// healthy / total, 0 when the pool is empty
    pub health_percentage: f64,
    /// Scaling advice for this snapshot
    pub recommendation: LoadBalanceRecommendation,
    /// Whether a new worker may be created right now
    pub can_create_new_worker: bool,
}

/// Selects workers for reuse and produces scaling advice.
///
/// Observes the pool's worker set; it never owns workers and never removes
/// them — removal policy lives in the pool.
pub struct Allocator {
    workers: SharedWorkers,
    settings: PoolSettings,
}

impl Allocator {
    pub(crate) fn new(workers: SharedWorkers, settings: PoolSettings) -> Self {
        Self { workers, settings }
    }

    /// Try to obtain a worker within `timeout`.
    ///
    /// Retries with bounded backoff (never busy-spins): each round probes the
    /// idle candidates, then checks whether a new worker may be created —
    /// [`Allocation::SpawnNeeded`] is returned immediately in that case so
    /// the caller can spawn. Only when the pool stays at capacity for the
    /// whole wait does this return [`Allocation::Exhausted`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Cancelled`] if the caller's token fires during a
    /// backoff sleep.
    pub async fn try_get_worker(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PoolResult<Allocation> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            if let Some(worker) = self.try_acquire_idle().await {
                debug!(attempts, worker = %worker.id(), "acquired idle worker");
                return Ok(Allocation::Acquired(worker));
            }

            if self.can_create_new_worker().await {
                debug!(attempts, "no idle worker, pool has capacity");
                return Ok(Allocation::SpawnNeeded);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    attempts,
                    timeout = ?timeout,
                    "worker wait exhausted with pool at capacity"
                );
                return Ok(Allocation::Exhausted);
            }

            // Backoff step from the outer timeout, capped at 100ms and at
            // whatever remains of the deadline.
            let step = (timeout / 10)
                .min(Duration::from_millis(100))
                .min(deadline - now);

            tokio::select! {
                () = cancel.cancelled() => return Err(PoolError::Cancelled),
                () = tokio::time::sleep(step) => {}
            }
        }
    }

    /// Probe the idle candidates once, in reuse-priority order.
    ///
    /// Candidates are healthy, non-busy workers ordered ascending by request
    /// count (load leveling), tie-broken by ascending idle time (prefer the
    /// most recently used worker, keeping hot workers warm).
    async fn try_acquire_idle(&self) -> Option<Arc<Worker>> {
        let mut candidates: Vec<Arc<Worker>> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.is_healthy() && !w.is_busy())
                .cloned()
                .collect()
        };

        candidates.sort_by_key(|w| (w.request_count(), w.idle_time()));

        for worker in candidates {
            if worker.try_acquire(self.settings.acquire_probe_timeout).await {
                return Some(worker);
            }
        }

        None
    }

    /// True iff both the total and the healthy worker counts are below
    /// `max_pool_size`.
    pub async fn can_create_new_worker(&self) -> bool {
        let (total, healthy) = {
            let workers = self.workers.read().await;
            let total = workers.len();
            let healthy = workers.values().filter(|w| w.is_healthy()).count();
            (total, healthy)
        };

        if total >= self.settings.max_pool_size {
            debug!(
                total,
                max = self.settings.max_pool_size,
                "worker count at capacity"
            );
            return false;
        }

        if healthy >= self.settings.max_pool_size {
            debug!(
                healthy,
                max = self.settings.max_pool_size,
                "healthy worker count at capacity"
            );
            return false;
        }

        true
    }

    /// Compute a load-balance snapshot with scaling advice
    pub async fn get_load_balance_info(&self) -> LoadBalanceInfo {
        let (total, busy, healthy) = {
            let workers = self.workers.read().await;
            let total = workers.len();
            let busy = workers.values().filter(|w| w.is_busy()).count();
            let healthy = workers.values().filter(|w| w.is_healthy()).count();
            (total, busy, healthy)
        };

        let percentage = |part: usize| {
            if total > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    part as f64 / total as f64 * 100.0
                }
            } else {
                0.0
            }
        };
        let load_percentage = percentage(busy);
        let health_percentage = percentage(healthy);

        LoadBalanceInfo {
            total_workers: total,
            busy_workers: busy,
            idle_workers: total - busy,
            healthy_workers: healthy,
            load_percentage,
            health_percentage,
            recommendation: Self::recommend(
                load_percentage,
                health_percentage,
                total,
                &self.settings,
            ),
            can_create_new_worker: self.can_create_new_worker().await,
        }
    }

    /// The fixed-priority recommendation table.
    ///
    /// Order matters: unhealthy cleanup trumps scaling in either direction.
    pub(crate) fn recommend(
        load_percentage: f64,
        health_percentage: f64,
        total_workers: usize,
        settings: &PoolSettings,
    ) -> LoadBalanceRecommendation {
        if health_percentage < 80.0 {
            return LoadBalanceRecommendation::CleanupUnhealthy;
        }

        if load_percentage > 90.0 && total_workers < settings.max_pool_size {
            return LoadBalanceRecommendation::CreateMoreWorkers;
        }

        if load_percentage < 20.0 && total_workers > settings.min_pool_size {
            return LoadBalanceRecommendation::ReduceWorkers;
        }

        LoadBalanceRecommendation::MaintainCurrent
    }

    /// Return a worker acquired through this allocator
    pub fn release_worker(&self, worker: &Worker) {
        worker.release();
        debug!(worker = %worker.id(), "worker returned to pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::process::Stdio;
    use tokio::process::Command;
    use tokio::sync::RwLock;

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_pool_size: min,
            max_pool_size: max,
            acquire_probe_timeout: Duration::from_millis(50),
            ..PoolSettings::default()
        }
    }

    fn empty_workers() -> SharedWorkers {
        Arc::new(RwLock::new(HashMap::new()))
    }

    fn spawn_worker(key: &str) -> Arc<Worker> {
        let mut cmd = Command::new("cat");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().expect("failed to spawn cat");
        Worker::adopt(
            child,
            key,
            format!("{key}-{}", uuid::Uuid::new_v4().simple()),
        )
    }

    async fn insert(workers: &SharedWorkers, worker: &Arc<Worker>) {
        workers
            .write()
            .await
            .insert(worker.id().to_string(), Arc::clone(worker));
    }

    async fn dispose_all(workers: &SharedWorkers) {
        for worker in workers.read().await.values() {
            worker.dispose();
        }
    }

    // ==================== Recommendation Table Tests ====================

    #[test]
    fn test_recommend_cleanup_unhealthy_first() {
        // total=10, healthy=7 -> health% = 70 -> cleanup wins regardless of load
        let s = settings(1, 10);
        assert_eq!(
            Allocator::recommend(100.0, 70.0, 10, &s),
            LoadBalanceRecommendation::CleanupUnhealthy
        );
    }

    #[test]
    fn test_recommend_create_more_workers() {
        // total=4, busy=4, healthy=4, max=10 -> load% = 100 > 90, total < max
        let s = settings(1, 10);
        assert_eq!(
            Allocator::recommend(100.0, 100.0, 4, &s),
            LoadBalanceRecommendation::CreateMoreWorkers
        );
    }

    #[test]
    fn test_recommend_reduce_workers() {
        // total=4, busy=0, healthy=4, min=1 -> load% = 0 < 20, total > min
        let s = settings(1, 10);
        assert_eq!(
            Allocator::recommend(0.0, 100.0, 4, &s),
            LoadBalanceRecommendation::ReduceWorkers
        );
    }

    #[test]
    fn test_recommend_maintain_at_max_capacity() {
        // total=5, busy=5, healthy=5, max=5 -> load% = 100 but total == max
        let s = settings(1, 5);
        assert_eq!(
            Allocator::recommend(100.0, 100.0, 5, &s),
            LoadBalanceRecommendation::MaintainCurrent
        );
    }

    #[test]
    fn test_recommend_maintain_at_min_with_low_load() {
        let s = settings(1, 5);
        assert_eq!(
            Allocator::recommend(0.0, 100.0, 1, &s),
            LoadBalanceRecommendation::MaintainCurrent
        );
    }

    // ==================== Load Info Tests ====================

    #[tokio::test]
    async fn test_load_info_empty_pool() {
        let allocator = Allocator::new(empty_workers(), settings(1, 3));
        let info = allocator.get_load_balance_info().await;

        assert_eq!(info.total_workers, 0);
        assert_eq!(info.busy_workers, 0);
        assert_eq!(info.idle_workers, 0);
        assert_eq!(info.healthy_workers, 0);
        assert!((info.load_percentage - 0.0).abs() < f64::EPSILON);
        assert!((info.health_percentage - 0.0).abs() < f64::EPSILON);
        assert!(info.can_create_new_worker);
    }

    #[tokio::test]
    async fn test_load_info_counts_busy_workers() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 3));

        let a = spawn_worker("k");
        let b = spawn_worker("k");
        insert(&workers, &a).await;
        insert(&workers, &b).await;

        assert!(a.try_acquire(Duration::from_millis(100)).await);

        let info = allocator.get_load_balance_info().await;
        assert_eq!(info.total_workers, 2);
        assert_eq!(info.busy_workers, 1);
        assert_eq!(info.idle_workers, 1);
        assert_eq!(info.healthy_workers, 2);
        assert!((info.load_percentage - 50.0).abs() < f64::EPSILON);

        a.release();
        dispose_all(&workers).await;
    }

    // ==================== Capacity Tests ====================

    #[tokio::test]
    async fn test_can_create_until_max() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 2));

        assert!(allocator.can_create_new_worker().await);

        insert(&workers, &spawn_worker("k")).await;
        assert!(allocator.can_create_new_worker().await);

        insert(&workers, &spawn_worker("k")).await;
        assert!(!allocator.can_create_new_worker().await);

        dispose_all(&workers).await;
    }

    // ==================== Selection Tests ====================

    #[tokio::test]
    async fn test_try_get_worker_prefers_fewest_requests() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 2));

        let veteran = spawn_worker("k");
        let fresh = spawn_worker("k");
        insert(&workers, &veteran).await;
        insert(&workers, &fresh).await;

        // Drive the veteran's request count up
        for _ in 0..3 {
            assert!(veteran.try_acquire(Duration::from_millis(100)).await);
            veteran.release();
        }

        let cancel = CancellationToken::new();
        let allocation = allocator
            .try_get_worker(Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        match allocation {
            Allocation::Acquired(w) => {
                assert_eq!(w.id(), fresh.id());
                w.release();
            }
            other => panic!("expected Acquired, got {other:?}"),
        }

        dispose_all(&workers).await;
    }

    #[tokio::test]
    async fn test_try_get_worker_signals_spawn_when_empty() {
        let allocator = Allocator::new(empty_workers(), settings(1, 3));
        let cancel = CancellationToken::new();

        let allocation = allocator
            .try_get_worker(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(matches!(allocation, Allocation::SpawnNeeded));
    }

    #[tokio::test]
    async fn test_try_get_worker_exhausted_when_all_busy_at_max() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 1));

        let worker = spawn_worker("k");
        insert(&workers, &worker).await;
        assert!(worker.try_acquire(Duration::from_millis(100)).await);

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let allocation = allocator
            .try_get_worker(Duration::from_millis(200), &cancel)
            .await
            .unwrap();

        assert!(matches!(allocation, Allocation::Exhausted));
        assert!(started.elapsed() < Duration::from_secs(3));

        worker.release();
        dispose_all(&workers).await;
    }

    #[tokio::test]
    async fn test_try_get_worker_cancellation() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 1));

        let worker = spawn_worker("k");
        insert(&workers, &worker).await;
        assert!(worker.try_acquire(Duration::from_millis(100)).await);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = allocator
            .try_get_worker(Duration::from_secs(30), &cancel)
            .await;
        assert!(matches!(result, Err(PoolError::Cancelled)));

        worker.release();
        dispose_all(&workers).await;
    }

    #[tokio::test]
    async fn test_release_worker_frees_the_slot() {
        let workers = empty_workers();
        let allocator = Allocator::new(Arc::clone(&workers), settings(1, 1));

        let worker = spawn_worker("k");
        insert(&workers, &worker).await;

        assert!(worker.try_acquire(Duration::from_millis(100)).await);
        allocator.release_worker(&worker);
        assert!(!worker.is_busy());
        assert!(worker.try_acquire(Duration::from_millis(100)).await);
        worker.release();

        dispose_all(&workers).await;
    }
}
