// ABOUTME: Error types for the worker pool
//
// One thiserror enum covers the whole crate surface. Creation and exhaustion
// failures propagate synchronously to the `get_worker` caller; health
// failures are only ever recorded in logs and reaped by cleanup.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker became available and the pool is at capacity
    #[error("no worker available for '{process_key}' and pool is at capacity")]
    PoolExhausted {
        /// Process key the request was for
        process_key: String,
    },

    /// Spawning a new worker failed, or the process died during its
    /// startup grace period
    #[error("worker creation failed for '{process_key}': {reason}")]
    WorkerCreation {
        /// Process key the worker was being created for
        process_key: String,
        /// Human-readable failure description
        reason: String,
        /// Underlying I/O error, when spawning itself failed
        #[source]
        source: Option<std::io::Error>,
    },

    /// A bounded wait expired while capacity theoretically existed.
    /// Distinct from [`PoolError::PoolExhausted`] so the two show up
    /// differently in logs.
    #[error("timed out after {waited:?} waiting for a worker")]
    AcquireTimeout {
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// A worker's process exited while the worker was owned or idle.
    ///
    /// Never returned from `get_worker`; constructed only for diagnostics
    /// (e.g. when a dead worker is returned to the pool) and reaped by
    /// `cleanup_unhealthy`.
    #[error("worker '{worker_id}' process {pid} exited unexpectedly")]
    ProcessUnhealthy {
        /// Id of the affected worker
        worker_id: String,
        /// OS process id of the exited process
        pid: u32,
    },

    /// The caller's cancellation token fired during a wait
    #[error("operation cancelled by caller")]
    Cancelled,

    /// Operation on a pool or manager that has been disposed
    #[error("pool has been disposed")]
    Disposed,

    /// Settings failed validation
    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
