//! The concurrent execution substrate: a fixed single-thread-per-core worker
//! pool fronted by a leased semaphore.

mod pool;
mod semaphore;

use std::sync::Arc;

use parking_lot::Mutex;

pub use semaphore::{TaskId, current_task, inside_exclusive_lock};

use crate::error::ExecutorError;
use pool::WorkerPool;
use semaphore::Semaphore;

/// Observer hook for shard failures. Receives a human-readable panic message.
pub type ShardFailureHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Owns the worker pool and the semaphore that governs how many logical
/// tasks may be in flight across every buffered aggregator compiled against
/// this executor.
pub struct Executor {
    pool: WorkerPool,
    semaphore: Arc<Semaphore>,
    shard_failure_hook: Mutex<Option<ShardFailureHook>>,
}

impl Executor {
    /// One worker per available core (falling back to one worker if the
    /// platform can't report parallelism), `2 * num_cores` permits.
    pub fn new() -> Arc<Self> {
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_num_cores(num_cores)
    }

    pub fn with_num_cores(num_cores: usize) -> Arc<Self> {
        let num_cores = num_cores.max(1);
        Arc::new(Self {
            pool: WorkerPool::new(num_cores),
            semaphore: Arc::new(Semaphore::new(2 * num_cores)),
            shard_failure_hook: Mutex::new(None),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Install (or clear) the shard-failure observer.
    pub fn set_shard_failure_hook(&self, hook: Option<ShardFailureHook>) {
        *self.shard_failure_hook.lock() = hook;
    }

    /// Submit one unit of work to `worker_index`, registering a lease on the
    /// ambient logical task. The job's panics are caught here (and again,
    /// redundantly, inside the worker itself) so a bad shard never poisons
    /// the lease accounting or takes its worker down.
    pub fn submit(
        &self,
        worker_index: usize,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), ExecutorError> {
        let num_workers = self.num_workers();
        if worker_index >= num_workers {
            return Err(ExecutorError::WorkerIndexOutOfRange(worker_index, num_workers));
        }

        let semaphore = self.semaphore.clone();
        let task = semaphore.begin_task();
        let hook = self.shard_failure_hook.lock().clone();

        let accepted = self.pool.submit(worker_index, move || {
            semaphore::with_current_task(task, || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    if let Some(hook) = &hook {
                        hook(&message);
                    }
                    tracing::error!(error = %message, "shard task panicked; shard continues with its previously good state");
                }
            });
            semaphore.end_task(task);
        });

        if !accepted {
            // Submission failed before the job could run: release the lease
            // immediately.
            self.semaphore.end_task(task);
            return Err(ExecutorError::ShuttingDown);
        }
        Ok(())
    }

    /// Run `body` with every permit held (the "exclusive lock" barrier).
    /// Nested calls on the same thread do not re-acquire.
    pub fn exclusive<R>(&self, body: impl FnOnce() -> R) -> R {
        self.semaphore.exclusive(body)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
