// ABOUTME: Per-key worker pool: get-or-spawn orchestration, cleanup, disposal
// ABOUTME: Serializes process creation per key and delegates selection/sweeping

//! The [`WorkerPool`] is the externally visible unit of pooling for one
//! logical process key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       WorkerPool                         │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  workers: Arc<RwLock<HashMap<id, Arc<Worker>>>>    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌────────────────┐   │
//! │  │  Allocator  │  │   Monitor   │  │  creation lock  │   │
//! │  │ (selection) │  │  (sweeps)   │  │ (one spawn at a │   │
//! │  │             │  │             │  │  time per key)  │   │
//! │  └─────────────┘  └─────────────┘  └────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `get_worker` first asks the allocator for an idle worker; only when the
//! allocator signals remaining capacity does the caller enter the creation
//! lock, re-probe (another caller may have spawned meanwhile), and spawn a
//! new interpreter process. The new process gets a grace period before it is
//! trusted as alive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{Allocation, Allocator, LoadBalanceInfo};
use crate::config::PoolSettings;
use crate::error::{PoolError, PoolResult};
use crate::monitor::{Monitor, PoolStats, ProcessInfo};
use crate::worker::{SharedWorkers, Worker};

/// Pool of interpreter worker processes for one logical key
pub struct WorkerPool {
    settings: PoolSettings,
    workers: SharedWorkers,
    allocator: Allocator,
    monitor: Monitor,

    /// At most one worker is spawned at a time per key
    creation_lock: Mutex<()>,

    disposed: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.settings)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool and start its background monitor.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSettings`] if the settings fail validation.
    pub fn new(settings: PoolSettings) -> PoolResult<Self> {
        settings.validate()?;

        let workers: SharedWorkers = Arc::new(RwLock::new(HashMap::new()));
        let allocator = Allocator::new(Arc::clone(&workers), settings.clone());
        let monitor = Monitor::new(Arc::clone(&workers), settings.clone());
        monitor.start();

        info!(
            min = settings.min_pool_size,
            max = settings.max_pool_size,
            "worker pool initialized"
        );

        Ok(Self {
            settings,
            workers,
            allocator,
            monitor,
            creation_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Pool settings
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Obtain a worker, reusing an idle one or spawning a new process.
    ///
    /// The returned worker is already acquired for the caller; it must be
    /// handed back with [`WorkerPool::return_worker`] exactly once, even on
    /// error paths.
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolExhausted`] — at capacity, nothing became free
    ///   within `request_timeout`
    /// - [`PoolError::AcquireTimeout`] — the creation lock could not be
    ///   entered in time
    /// - [`PoolError::WorkerCreation`] — spawn failed or the process died
    ///   during its grace period
    /// - [`PoolError::Cancelled`] — the caller's token fired during a wait
    /// - [`PoolError::Disposed`] — the pool has been disposed
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

        debug!(process_key = %process_key, "worker requested");

        match self
            .allocator
            .try_get_worker(self.settings.request_timeout, cancel)
            .await?
        {
            Allocation::Acquired(worker) => {
                debug!(process_key = %process_key, worker = %worker.id(), "reusing existing worker");
                return Ok(worker);
            }
            Allocation::Exhausted => {
                warn!(process_key = %process_key, "pool exhausted");
                return Err(PoolError::PoolExhausted {
                    process_key: process_key.to_string(),
                });
            }
            Allocation::SpawnNeeded => {}
        }

        // One spawn at a time per key. The wait is bounded and cancellable so
        // a stuck creation cannot pin callers forever.
        let _guard = tokio::select! {
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            locked = tokio::time::timeout(self.settings.request_timeout, self.creation_lock.lock()) => {
                match locked {
                    Ok(guard) => guard,
                    Err(_) => {
                        return Err(PoolError::AcquireTimeout {
                            waited: self.settings.request_timeout,
                        })
                    }
                }
            }
        };

        // Double check: another caller may have created a worker while we
        // waited for the lock.
        match self
            .allocator
            .try_get_worker(self.settings.acquire_probe_timeout, cancel)
            .await?
        {
            Allocation::Acquired(worker) => {
                debug!(process_key = %process_key, worker = %worker.id(), "worker appeared while waiting for creation lock");
                return Ok(worker);
            }
            Allocation::Exhausted => {
                return Err(PoolError::PoolExhausted {
                    process_key: process_key.to_string(),
                })
            }
            Allocation::SpawnNeeded => {}
        }

        self.spawn_worker(process_key, executable_path, script_path, cancel)
            .await
    }

    /// Spawn one interpreter process, verify it survives the grace period,
    /// and register it already acquired for the caller.
    async fn spawn_worker(
        &self,
        process_key: &str,
        executable_path: &Path,
        script_path: &Path,
        cancel: &CancellationToken,
    ) -> PoolResult<Arc<Worker>> {
        let worker_id = format!("{process_key}-{}", Uuid::new_v4().simple());

        debug!(
            process_key = %process_key,
            executable = %executable_path.display(),
            script = %script_path.display(),
            "spawning worker process"
        );

        let mut cmd = Command::new(executable_path);
        cmd.arg(script_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PoolError::WorkerCreation {
            process_key: process_key.to_string(),
            reason: "failed to spawn process".to_string(),
            source: Some(e),
        })?;

        // Grace period before trusting the process as alive. A cancelled
        // caller must not leak the child; kill_on_drop reaps it.
        tokio::select! {
            () = cancel.cancelled() => {
                drop(child);
                return Err(PoolError::Cancelled);
            }
            () = tokio::time::sleep(self.settings.spawn_grace_period) => {}
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(PoolError::WorkerCreation {
                    process_key: process_key.to_string(),
                    reason: format!("process exited during startup grace period ({status})"),
                    source: None,
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Err(PoolError::WorkerCreation {
                    process_key: process_key.to_string(),
                    reason: "failed to check process status".to_string(),
                    source: Some(e),
                });
            }
        }

        let worker = Worker::adopt(child, process_key, worker_id);

        // Acquire before registering so a racing caller can never steal a
        // just-created worker; every get_worker success pairs with exactly
        // one release.
        if !worker
            .try_acquire(self.settings.acquire_probe_timeout)
            .await
        {
            worker.dispose();
            return Err(PoolError::WorkerCreation {
                process_key: process_key.to_string(),
                reason: "process died before first acquire".to_string(),
                source: None,
            });
        }

        self.workers
            .write()
            .await
            .insert(worker.id().to_string(), Arc::clone(&worker));

        info!(
            process_key = %process_key,
            worker = %worker.id(),
            pid = worker.pid(),
            "created worker"
        );
        Ok(worker)
    }

    /// Return a worker obtained from [`WorkerPool::get_worker`].
    ///
    /// Never blocks. A dead worker coming back is recorded for diagnostics
    /// and left for `cleanup_unhealthy`.
    pub fn return_worker(&self, worker: &Worker) {
        if !worker.is_healthy() {
            warn!(
                error = %PoolError::ProcessUnhealthy {
                    worker_id: worker.id().to_string(),
                    pid: worker.pid(),
                },
                "worker returned in unhealthy state"
            );
        }

        self.allocator.release_worker(worker);
    }

    /// Remove and dispose every unhealthy worker; returns the count removed.
    ///
    /// Busy workers are removed too — an exited process cannot be
    /// meaningfully held, and the holder discovers the death through its own
    /// stream I/O.
    pub async fn cleanup_unhealthy(&self) -> usize {
        let mut workers = self.workers.write().await;

        let dead: Vec<String> = workers
            .iter()
            .filter(|(_, w)| !w.is_healthy())
            .map(|(id, _)| id.clone())
            .collect();

        let mut cleaned = 0;
        for id in dead {
            if let Some(worker) = workers.remove(&id) {
                worker.dispose();
                cleaned += 1;
                info!(worker = %id, "removed unhealthy worker");
            }
        }

        if cleaned > 0 {
            info!(count = cleaned, "cleaned up unhealthy workers");
        }
        cleaned
    }

    /// Remove and dispose healthy workers idle beyond `worker_idle_timeout`,
    /// never reducing the pool below `min_pool_size`. Busy workers are never
    /// touched. Returns the count removed.
    pub async fn cleanup_idle(&self) -> usize {
        let mut workers = self.workers.write().await;

        let expired: Vec<String> = workers
            .iter()
            .filter(|(_, w)| {
                w.is_healthy()
                    && !w.is_busy()
                    && w.idle_time() > self.settings.worker_idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut cleaned = 0;
        for id in expired {
            if workers.len() <= self.settings.min_pool_size {
                break;
            }

            // Re-check under the write lock: the worker may have been
            // acquired since the candidate list was built.
            if workers.get(&id).is_some_and(|w| w.is_busy()) {
                continue;
            }

            if let Some(worker) = workers.remove(&id) {
                let idle_secs = worker.idle_time().as_secs();
                worker.dispose();
                cleaned += 1;
                info!(worker = %id, idle_secs, "removed idle worker");
            }
        }

        if cleaned > 0 {
            info!(count = cleaned, "cleaned up idle workers");
        }
        cleaned
    }

    /// Aggregate pool statistics
    pub async fn get_stats(&self) -> PoolStats {
        self.monitor.get_stats().await
    }

    /// Load-balance snapshot with scaling advice
    pub async fn get_load_balance_info(&self) -> LoadBalanceInfo {
        self.allocator.get_load_balance_info().await
    }

    /// Snapshot of one worker by id
    pub async fn get_process_info(&self, worker_id: &str) -> Option<ProcessInfo> {
        self.monitor.get_process_info(worker_id).await
    }

    /// Snapshots of every worker
    pub async fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        self.monitor.get_all_process_info().await
    }

    /// True iff at least one worker is healthy
    pub async fn is_healthy(&self) -> bool {
        self.workers.read().await.values().any(|w| w.is_healthy())
    }

    /// Total workers in the pool
    pub async fn total_worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Workers currently held by callers
    pub async fn active_worker_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.is_busy())
            .count()
    }

    /// Healthy workers not currently held
    pub async fn idle_worker_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.is_healthy() && !w.is_busy())
            .count()
    }

    /// Ids of all workers in the pool
    pub async fn worker_ids(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }

    /// Dispose the pool: stop the monitor and kill every worker. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disposing worker pool");
        self.monitor.stop().await;

        let mut workers = self.workers.write().await;
        for (_, worker) in workers.drain() {
            worker.dispose();
        }

        info!("worker pool disposed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Best-effort cleanup when dispose() was never called; kill_on_drop
        // on each child covers whatever the try_write cannot reach.
        self.monitor.cancel();
        if let Ok(mut workers) = self.workers.try_write() {
            for (_, worker) in workers.drain() {
                worker.dispose();
            }
        }
    }
}
