//! One single-threaded worker per CPU core. Each worker owns a FIFO queue and
//! swallows panics inside submitted jobs so that one bad task never takes
//! the worker thread down.

use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    tx: Sender<Job>,
    // Kept only so the thread is detached (not joined) when the pool drops;
    // `JoinHandle::drop` never blocks: workers must not prevent process
    // shutdown.
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let workers = (0..num_workers)
            .map(|idx| {
                let (tx, rx) = unbounded::<Job>();
                let handle = std::thread::Builder::new()
                    .name(format!("stream-analysis-worker-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread");
                Worker { tx, handle }
            })
            .collect();
        Self { workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue `job` onto the given worker's FIFO queue. Returns `false` if
    /// the worker's queue has been closed (pool shutting down) or the index
    /// is out of range.
    pub fn submit(&self, worker_index: usize, job: impl FnOnce() + Send + 'static) -> bool {
        match self.workers.get(worker_index) {
            Some(worker) => worker.tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }
}
