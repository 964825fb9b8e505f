//! The buffered aggregator adapter: makes `process(msg)` cheap and
//! off-thread by batching into a capacity-bounded accumulator and
//! dispatching flushes to the executor.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::{Executor, inside_exclusive_lock};
use crate::generator::{CreatedOperator, OperatorGenerator, StageLabel};
use crate::operator::{
    Aggregator, BufferedAggregator, CombinerFn, DeserializerFn, EmitterFn, Flushable,
    SerializerFn, StreamOperator,
};
use crate::options::CreateOptions;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Simple round-robin source used when no routing hash is configured, as a
/// stand-in for picking a worker at random; see `DESIGN.md` for why a
/// counter stands in for true randomness here, same rationale as `split`'s
/// execution affinity.
static NEXT_RANDOM_WORKER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

pub struct BufferedAggregatorAdapter<M, V> {
    downstream: Arc<dyn Aggregator<M, V>>,
    executor: Arc<Executor>,
    capacity: usize,
    hash: Option<u64>,
    acc: Mutex<Vec<M>>,
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> BufferedAggregatorAdapter<M, V> {
    pub fn new(
        downstream: Arc<dyn Aggregator<M, V>>,
        executor: Arc<Executor>,
        capacity: usize,
        hash: Option<u64>,
    ) -> Self {
        Self {
            downstream,
            executor,
            capacity: capacity.max(1),
            hash,
            acc: Mutex::new(Vec::new()),
        }
    }

    fn choose_worker(&self) -> usize {
        let num_workers = self.executor.num_workers();
        match self.hash {
            Some(h) => (h as usize) % num_workers,
            None => NEXT_RANDOM_WORKER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % num_workers,
        }
    }

    /// Flush `batch` to the downstream operator: synchronously if the
    /// calling thread already holds the exclusive lock (so a flush barrier
    /// completes before releasing it), asynchronously on a worker otherwise.
    fn dispatch_flush(&self, batch: Vec<M>) {
        if batch.is_empty() {
            return;
        }
        let downstream = self.downstream.clone();
        if inside_exclusive_lock() {
            downstream.process_all(&batch);
        } else {
            let worker = self.choose_worker();
            // If submission fails (executor shutting down) the batch is
            // dropped silently — the one sanctioned silent-drop path: a
            // flush that genuinely cannot be initiated.
            let _ = self.executor.submit(worker, move || {
                downstream.process_all(&batch);
            });
        }
    }

    /// `process(msg)`: append to the current accumulator, swapping in a
    /// fresh one and flushing the old one when it's full.
    pub fn process(&self, msg: M) {
        let mut pending = Some(msg);
        loop {
            {
                let mut acc = self.acc.lock();
                if acc.len() < self.capacity {
                    acc.push(pending.take().expect("pending message already consumed"));
                    return;
                }
            }
            let old = std::mem::take(&mut *self.acc.lock());
            self.dispatch_flush(old);
        }
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> StreamOperator<M>
    for BufferedAggregatorAdapter<M, V>
{
    fn process_all(&self, msgs: &[M]) {
        for msg in msgs {
            self.process(msg.clone());
        }
    }

    fn reset(&self) {
        // Forwarded to the downstream operator only — any messages still
        // sitting in `acc` are left as-is and will surface in a later flush.
        self.downstream.reset();
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> Aggregator<M, V>
    for BufferedAggregatorAdapter<M, V>
{
    fn deref_snapshot(&self) -> V {
        self.downstream.deref_snapshot()
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> BufferedAggregator<M, V>
    for BufferedAggregatorAdapter<M, V>
{
    fn process_one(&self, msg: M) {
        self.process(msg);
    }

    fn flush_now(&self) {
        <Self as Flushable>::flush(self);
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> Flushable
    for BufferedAggregatorAdapter<M, V>
{
    fn flush(&self) {
        tracing::trace!("flushing buffered aggregator adapter");
        self.executor.exclusive(|| {
            let batch = std::mem::take(&mut *self.acc.lock());
            if !batch.is_empty() {
                self.downstream.process_all(&batch);
            }
            if let Some(f) = self.downstream.as_flushable() {
                f.flush();
            }
        });
    }
}

/// Generator-level decorator implementing the `aggregator_generator_wrapper`
/// option: wraps an aggregator generator so
/// every operator it creates is buffered. Delegates all static metadata to
/// the inner generator — buffering is an instantiation-time concern, not a
/// concurrency-eligibility one.
pub struct BufferedAggregatorGenerator<M, V> {
    inner: Arc<dyn OperatorGenerator<M, V>>,
    capacity: usize,
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> BufferedAggregatorGenerator<M, V> {
    pub fn new(inner: Arc<dyn OperatorGenerator<M, V>>, capacity: usize) -> Self {
        Self { inner, capacity }
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> OperatorGenerator<M, V>
    for BufferedAggregatorGenerator<M, V>
{
    fn is_aggregator(&self) -> bool {
        true
    }

    fn is_concurrent(&self) -> bool {
        self.inner.is_concurrent()
    }

    fn combiner(&self) -> Option<CombinerFn<V>> {
        self.inner.combiner()
    }

    fn emitter(&self) -> EmitterFn<V> {
        self.inner.emitter()
    }

    fn serializer(&self) -> SerializerFn<V> {
        self.inner.serializer()
    }

    fn deserializer(&self) -> DeserializerFn<V> {
        self.inner.deserializer()
    }

    fn descriptor(&self) -> Vec<StageLabel> {
        self.inner.descriptor()
    }

    fn create(&self, options: &CreateOptions<M, V>) -> CreatedOperator<M, V> {
        let downstream = match self.inner.create(options) {
            CreatedOperator::Aggregator(agg) => agg,
            CreatedOperator::Processor(_) => {
                unreachable!("BufferedAggregatorGenerator only wraps aggregator generators")
            }
        };
        let executor = options.executor.clone().unwrap_or_else(Executor::new);
        let hash = options.execution_affinity;
        CreatedOperator::Aggregator(Arc::new(BufferedAggregatorAdapter::new(
            downstream, executor, self.capacity, hash,
        )))
    }
}

/// `buffered(generator)` at the default capacity (1024).
pub fn buffered<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static>(
    inner: Arc<dyn OperatorGenerator<M, V>>,
) -> Arc<BufferedAggregatorGenerator<M, V>> {
    Arc::new(BufferedAggregatorGenerator::new(inner, DEFAULT_CAPACITY))
}

pub fn buffered_with_capacity<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static>(
    inner: Arc<dyn OperatorGenerator<M, V>>,
    capacity: usize,
) -> Arc<BufferedAggregatorGenerator<M, V>> {
    Arc::new(BufferedAggregatorGenerator::new(inner, capacity))
}
