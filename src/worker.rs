// ABOUTME: Worker wrapping one interpreter subprocess with usage bookkeeping
// ABOUTME: Guards exclusive access via a single-permit semaphore and tracks liveness atomically

//! A [`Worker`] owns exactly one OS process and guards exclusive access to it.
//!
//! Exclusivity is a single-permit [`Semaphore`]: at most one caller holds a
//! worker at any instant, however many race to acquire it. Liveness is an
//! atomic flag written exactly once by a background exit-watcher task that
//! owns the [`Child`] handle; the acquire path never reads raw OS process
//! state.
//!
//! Standard output is drained continuously into a takeable channel and
//! standard error into the log, so the child can never block on a full pipe
//! regardless of whether the protocol layer is consuming.
//!
//! State machine: `Created → Idle ⇄ Busy → Idle … → Terminated`, where
//! `Terminated` is reached either through [`Worker::dispose`] or
//! asynchronously when the process exits on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Shared, concurrently mutated map from worker id to worker.
///
/// Owned by the pool; the allocator and monitor observe it.
pub(crate) type SharedWorkers =
    Arc<RwLock<std::collections::HashMap<String, Arc<Worker>>>>;

/// Grace given to a process between SIGTERM and SIGKILL during disposal
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// One pooled interpreter process plus its usage bookkeeping
pub struct Worker {
    /// Generated worker id, `"{process_key}-{uuid}"`
    id: String,

    /// Logical key of the owning pool
    process_key: String,

    /// OS process id, captured at spawn time
    pid: u32,

    /// Exclusivity primitive: one permit, one holder
    slot: Semaphore,

    /// Whether a caller currently holds this worker
    busy: AtomicBool,

    /// Set exactly once by the exit watcher when the process dies
    exited: AtomicBool,

    /// Set by `dispose()`; a disposed worker is never healthy
    disposed: AtomicBool,

    /// Number of successful acquires over the worker's lifetime
    request_count: AtomicU64,

    created_at: Instant,
    created_at_utc: DateTime<Utc>,

    /// Milliseconds from `created_at` to the most recent acquire
    last_used_millis: AtomicU64,

    /// Cancelled by `dispose()` to make the watcher terminate the process
    kill_token: CancellationToken,

    /// One-shot stdin handle for the out-of-scope protocol layer
    stdin: Mutex<Option<ChildStdin>>,

    /// One-shot receiver of drained stdout lines
    output: Mutex<Option<UnboundedReceiver<String>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("busy", &self.is_busy())
            .field("healthy", &self.is_healthy())
            .field("request_count", &self.request_count())
            .finish()
    }
}

impl Worker {
    /// Wrap a freshly spawned child process into a pooled worker.
    ///
    /// Takes over the child's piped stdio: stdout lines flow into the channel
    /// returned by [`Worker::take_output`], stderr lines go to the log. A
    /// watcher task owns the `Child`, reaps it on exit and records the exit
    /// in the worker's liveness flag.
    pub(crate) fn adopt(mut child: Child, process_key: &str, id: String) -> Arc<Self> {
        let pid = child.id().unwrap_or(0);

        let output_rx = child.stdout.take().map(|stdout| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // If the receiver is gone we keep reading anyway so the
                    // child never blocks on a full pipe.
                    let _ = tx.send(line);
                }
                debug!(worker = %worker_id, "stdout drain finished");
            });
            rx
        });

        if let Some(stderr) = child.stderr.take() {
            let worker_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker = %worker_id, line = %line, "worker stderr");
                }
            });
        }

        let stdin = child.stdin.take();

        let worker = Arc::new(Self {
            id,
            process_key: process_key.to_string(),
            pid,
            slot: Semaphore::new(1),
            busy: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            last_used_millis: AtomicU64::new(0),
            kill_token: CancellationToken::new(),
            stdin: Mutex::new(stdin),
            output: Mutex::new(output_rx),
        });

        let watched = Arc::clone(&worker);
        tokio::spawn(async move {
            Self::watch_exit(child, watched).await;
        });

        worker
    }

    /// Watcher task: owns the child, awaits exit or a kill signal, reaps it,
    /// then records the exit. Clearing `busy` here mirrors the fact that an
    /// exited process cannot be meaningfully held by anyone.
    async fn watch_exit(mut child: Child, worker: Arc<Self>) {
        let status = tokio::select! {
            status = child.wait() => status,
            () = worker.kill_token.cancelled() => {
                Self::terminate(&mut child, worker.pid).await
            }
        };

        match status {
            Ok(status) => {
                warn!(
                    worker = %worker.id,
                    pid = worker.pid,
                    status = %status,
                    "worker process exited"
                );
            }
            Err(e) => {
                error!(worker = %worker.id, pid = worker.pid, error = %e, "failed to reap worker process");
            }
        }

        worker.exited.store(true, Ordering::SeqCst);
        worker.busy.store(false, Ordering::SeqCst);
        // Wake any pending acquires; they observe the dead worker and fail.
        worker.slot.close();
    }

    /// Terminate the child: SIGTERM, bounded wait, then SIGKILL.
    async fn terminate(child: &mut Child, pid: u32) -> std::io::Result<std::process::ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if pid > 0 {
                #[allow(clippy::cast_possible_wrap)]
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }

            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(result) => return result,
                Err(_) => {
                    warn!(pid, "worker ignored SIGTERM, sending SIGKILL");
                }
            }
        }

        if let Err(e) = child.kill().await {
            error!(pid, error = %e, "failed to kill worker process");
        }
        child.wait().await
    }

    /// Attempt to take exclusive ownership of this worker within `timeout`.
    ///
    /// Returns `false` immediately if the process has already exited or the
    /// worker is disposed. On success marks the worker busy, stamps the
    /// last-used time and increments the request counter.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        if !self.is_healthy() {
            return false;
        }

        let acquired = match tokio::time::timeout(timeout, self.slot.acquire()).await {
            Ok(Ok(permit)) => {
                // Permit handed back explicitly via release()
                permit.forget();
                true
            }
            // Closed semaphore (dead worker) or timeout
            _ => false,
        };

        if !acquired {
            return false;
        }

        // The process may have died between the health check and the permit
        // grant; never hand out a corpse.
        if !self.is_healthy() {
            self.slot.add_permits(1);
            return false;
        }

        self.busy.store(true, Ordering::SeqCst);
        self.last_used_millis.store(
            u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        self.request_count.fetch_add(1, Ordering::SeqCst);
        debug!(worker = %self.id, pid = self.pid, "worker acquired");
        true
    }

    /// Return ownership of this worker; marks it idle.
    ///
    /// Must be called exactly once per successful [`Worker::try_acquire`].
    /// Calling it twice for one acquire is undefined caller behavior.
    pub fn release(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        self.busy.store(false, Ordering::SeqCst);
        self.slot.add_permits(1);
        debug!(worker = %self.id, pid = self.pid, "worker released");
    }

    /// True iff the process has not exited and the worker has not been disposed
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && !self.exited.load(Ordering::SeqCst)
    }

    /// Whether a caller currently holds this worker
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Duration since the last successful acquire (or creation, if never used)
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        let since_last_use = Duration::from_millis(self.last_used_millis.load(Ordering::SeqCst));
        self.created_at.elapsed().saturating_sub(since_last_use)
    }

    /// Duration since the worker was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of successful acquires over the worker's lifetime
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Generated worker id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical key of the owning pool
    #[must_use]
    pub fn process_key(&self) -> &str {
        &self.process_key
    }

    /// OS process id
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wall-clock creation time
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at_utc
    }

    /// Wall-clock time of the last successful acquire
    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        let millis = self.last_used_millis.load(Ordering::SeqCst);
        self.created_at_utc
            + chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// Take the child's stdin handle for the protocol layer.
    ///
    /// Can only be taken once; subsequent calls return `None`.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Take the receiver of drained stdout lines.
    ///
    /// Can only be taken once; subsequent calls return `None`. The drain
    /// keeps running even if this is never taken or the receiver is dropped.
    pub fn take_output(&self) -> Option<UnboundedReceiver<String>> {
        self.output.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Dispose the worker: terminate the process if still running and close
    /// the exclusivity primitive. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(worker = %self.id, pid = self.pid, "disposing worker");
        self.busy.store(false, Ordering::SeqCst);
        self.slot.close();
        self.kill_token.cancel();
    }
}
