//! The leased semaphore and exclusive-lock barrier. The semaphore tracks
//! *logical tasks*, not threads: one producer task that fans out into many
//! submitted work units holds at most one permit for its whole lifetime, via
//! the lease table.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

/// Opaque identity for one logical task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = Cell::new(None);
    static INSIDE_EXCLUSIVE: Cell<bool> = Cell::new(false);
}

/// The ambient "which logical task am I running inside" slot.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}

fn set_current_task(task: Option<TaskId>) {
    CURRENT_TASK.with(|c| c.set(task));
}

/// The ambient "do I already hold the exclusive lock" flag, scoped to the
/// thread executing the barrier's body.
pub fn inside_exclusive_lock() -> bool {
    INSIDE_EXCLUSIVE.with(|c| c.get())
}

fn set_inside_exclusive_lock(value: bool) {
    INSIDE_EXCLUSIVE.with(|c| c.set(value));
}

/// Rebinds the ambient task id for the duration of `f`, restoring the
/// previous value on return (or unwind). Used by the worker when it invokes
/// a submitted job: the runnable re-binds the ambient task id to `t` while
/// it executes user work.
pub fn with_current_task<R>(task: TaskId, f: impl FnOnce() -> R) -> R {
    let prev = current_task();
    set_current_task(Some(task));
    let result = f();
    set_current_task(prev);
    result
}

/// A counting permit set governing concurrent logical tasks, plus the
/// exclusive-lock escalation used by flush/reset barriers.
pub struct Semaphore {
    capacity: usize,
    available: Mutex<usize>,
    not_empty: Condvar,
    leases: Mutex<FxHashMap<TaskId, usize>>,
    /// Serializes competing `exclusive()` callers so two barriers never each
    /// drain half the permit pool and deadlock waiting on the other half.
    barrier_gate: Mutex<()>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            available: Mutex::new(capacity),
            not_empty: Condvar::new(),
            leases: Mutex::new(FxHashMap::default()),
            barrier_gate: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn acquire_one(&self) {
        let mut avail = self.available.lock();
        while *avail == 0 {
            self.not_empty.wait(&mut avail);
        }
        *avail -= 1;
    }

    fn release_n(&self, n: usize) {
        let mut avail = self.available.lock();
        *avail += n;
        self.not_empty.notify_all();
    }

    /// Begin a logical task on submission. If the current thread already
    /// runs inside a task, this only increments that task's lease count — no
    /// permit is touched.
    pub fn begin_task(&self) -> TaskId {
        if let Some(existing) = current_task() {
            let mut leases = self.leases.lock();
            *leases.entry(existing).or_insert(0) += 1;
            return existing;
        }
        self.acquire_one();
        let task = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        self.leases.lock().insert(task, 1);
        task
    }

    /// Complete (or abandon) one submitted work unit for `task`. Releases a
    /// permit once the task's lease count reaches zero.
    pub fn end_task(&self, task: TaskId) {
        let mut leases = self.leases.lock();
        match leases.get_mut(&task) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    leases.remove(&task);
                    drop(leases);
                    self.release_n(1);
                }
            }
            // The entry was never created (submission failed before the
            // first increment) — release the permit directly.
            None => {
                drop(leases);
                self.release_n(1);
            }
        }
    }

    /// Run `body` while holding every permit, unless the calling thread
    /// already holds the exclusive lock (nested flush calls do not
    /// self-deadlock).
    pub fn exclusive<R>(&self, body: impl FnOnce() -> R) -> R {
        if inside_exclusive_lock() {
            return body();
        }
        let _gate = self.barrier_gate.lock();
        for _ in 0..self.capacity {
            self.acquire_one();
        }
        set_inside_exclusive_lock(true);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        set_inside_exclusive_lock(false);
        self.release_n(self.capacity);
        match outcome {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_task_holds_one_permit() {
        let sem = Semaphore::new(4);
        let t = sem.begin_task();
        assert_eq!(*sem.available.lock(), 3);
        with_current_task(t, || {
            // A nested submission from inside the same logical task only
            // increments the lease, it does not take a second permit.
            let same = sem.begin_task();
            assert_eq!(same, t);
        });
        assert_eq!(*sem.available.lock(), 3);
        sem.end_task(t); // outer unit done
        sem.end_task(t); // inner unit done -> lease reaches zero -> permit released
        assert_eq!(*sem.available.lock(), 4);
    }

    #[test]
    fn exclusive_drains_and_restores_all_permits() {
        let sem = Semaphore::new(4);
        sem.exclusive(|| {
            assert_eq!(*sem.available.lock(), 0);
            assert!(inside_exclusive_lock());
        });
        assert_eq!(*sem.available.lock(), 4);
        assert!(!inside_exclusive_lock());
    }

    #[test]
    fn nested_exclusive_does_not_deadlock() {
        let sem = Semaphore::new(2);
        sem.exclusive(|| {
            sem.exclusive(|| {
                assert_eq!(*sem.available.lock(), 0);
            });
        });
        assert_eq!(*sem.available.lock(), 2);
    }
}
