// ABOUTME: Pool of long-lived interpreter worker processes, keyed per plugin
//
// Each pool keeps a bounded set of subprocess workers alive across requests
// so callers pay interpreter startup cost once, not per request.
//
// Key components:
// - config: PoolSettings with size bounds, timeouts, and sweep interval
// - worker: one subprocess with exclusive-access semaphore and exit watcher
// - allocator: idle-worker selection and load-balance recommendations
// - monitor: periodic health sweeps and stats/process-info snapshots
// - pool: per-key get-or-spawn orchestration and cleanup
// - manager: routes requests to per-key pools, creating them lazily

pub mod allocator;
pub mod config;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod worker;

// Re-exports for convenient access
pub use allocator::{Allocation, LoadBalanceInfo, LoadBalanceRecommendation};
pub use config::PoolSettings;
pub use error::{PoolError, PoolResult};
pub use manager::PoolManager;
pub use monitor::{PoolStats, ProcessInfo};
pub use pool::WorkerPool;
pub use worker::Worker;
