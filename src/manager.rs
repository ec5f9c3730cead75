// ABOUTME: Routes worker requests to per-key pools, creating pools lazily
// ABOUTME: Fans cleanup and introspection out across every pool it owns

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::allocator::LoadBalanceInfo;
use crate::config::PoolSettings;
use crate::error::{PoolError, PoolResult};
use crate::monitor::{PoolStats, ProcessInfo};
use crate::pool::WorkerPool;
use crate::worker::Worker;

/// Owns one [`WorkerPool`] per process key, created on first use.
///
/// Every pool inherits the manager's default settings. Keys are opaque
/// strings chosen by the caller, typically one per plugin.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
    default_settings: PoolSettings,
    disposed: AtomicBool,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("default_settings", &self.default_settings)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl PoolManager {
    /// Create a manager with the given default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSettings`] if the settings fail validation.
    pub fn new(default_settings: PoolSettings) -> PoolResult<Self> {
        default_settings.validate()?;
        Ok(Self {
            pools: RwLock::new(HashMap::new()),
            default_settings,
            disposed: AtomicBool::new(false),
        })
    }

    /// Manager with default settings
    pub fn with_defaults() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            default_settings: PoolSettings::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Get the pool for `process_key`, creating it on first use.
    async fn pool_for(&self, process_key: &str) -> PoolResult<Arc<WorkerPool>> {
        if let Some(pool) = self.pools.read().await.get(process_key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        // Another caller may have created it while we waited for the lock
        if let Some(pool) = pools.get(process_key) {
            return Ok(Arc::clone(pool));
        }

        info!(process_key = %process_key, "creating worker pool");
        let pool = Arc::new(WorkerPool::new(self.default_settings.clone())?);
        pools.insert(process_key.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Obtain a worker from the pool for `process_key`, creating the pool if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Propagates any [`PoolError`] from the underlying pool, or
    /// [`PoolError::Disposed`] if the manager has been disposed.
    pub async fn get_worker(
        &self,
        process_key: &str,
        executable_path: &Path,
        script_path: &Path,
        cancel: &CancellationToken,
    ) -> PoolResult<Arc<Worker>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PoolError::Disposed);
        }

        let pool = self.pool_for(process_key).await?;
        pool.get_worker(process_key, executable_path, script_path, cancel)
            .await
    }

    /// Return a worker to the pool it came from. Unknown keys are a no-op.
    pub async fn return_worker(&self, process_key: &str, worker: &Worker) {
        if let Some(pool) = self.pools.read().await.get(process_key) {
            pool.return_worker(worker);
        }
    }

    /// Statistics for one pool, `None` if the key has no pool
    pub async fn get_stats(&self, process_key: &str) -> Option<PoolStats> {
        let pool = Arc::clone(self.pools.read().await.get(process_key)?);
        Some(pool.get_stats().await)
    }

    /// Load-balance snapshot for one pool, `None` if the key has no pool
    pub async fn get_load_balance_info(&self, process_key: &str) -> Option<LoadBalanceInfo> {
        let pool = Arc::clone(self.pools.read().await.get(process_key)?);
        Some(pool.get_load_balance_info().await)
    }

    /// Snapshot of one worker in one pool
    pub async fn get_process_info(
        &self,
        process_key: &str,
        worker_id: &str,
    ) -> Option<ProcessInfo> {
        let pool = Arc::clone(self.pools.read().await.get(process_key)?);
        pool.get_process_info(worker_id).await
    }

    /// Snapshots of every worker in one pool, empty if the key has no pool
    pub async fn get_all_process_info(&self, process_key: &str) -> Vec<ProcessInfo> {
        let pool = match self.pools.read().await.get(process_key) {
            Some(pool) => Arc::clone(pool),
            None => return Vec::new(),
        };
        pool.get_all_process_info().await
    }

    /// Remove unhealthy workers from one pool; 0 if the key has no pool
    pub async fn cleanup_unhealthy(&self, process_key: &str) -> usize {
        let pool = match self.pools.read().await.get(process_key) {
            Some(pool) => Arc::clone(pool),
            None => return 0,
        };
        pool.cleanup_unhealthy().await
    }

    /// Remove idle-expired workers from one pool; 0 if the key has no pool
    pub async fn cleanup_idle(&self, process_key: &str) -> usize {
        let pool = match self.pools.read().await.get(process_key) {
            Some(pool) => Arc::clone(pool),
            None => return 0,
        };
        pool.cleanup_idle().await
    }

    /// Remove unhealthy workers from every pool; returns per-key counts
    pub async fn cleanup_all_unhealthy(&self) -> HashMap<String, usize> {
        let pools: Vec<(String, Arc<WorkerPool>)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(k, p)| (k.clone(), Arc::clone(p)))
            .collect();

        let mut cleaned = HashMap::new();
        for (key, pool) in pools {
            cleaned.insert(key, pool.cleanup_unhealthy().await);
        }
        cleaned
    }

    /// Keys of every pool currently managed
    pub async fn pool_keys(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Dispose every pool and refuse further requests. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disposing pool manager");
        let pools: Vec<Arc<WorkerPool>> =
            self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.dispose().await;
        }
        info!("pool manager disposed");
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}
