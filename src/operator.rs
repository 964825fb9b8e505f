//! The operator contracts: [`StreamOperator`], [`Aggregator`],
//! [`BufferedAggregator`], and the `Flushable` escape hatch used to forward
//! barrier operations without needing trait-object upcasting.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UsageError;

/// A reducer transforms a batch of messages into a (possibly different-size)
/// batch. Batch-at-a-time rather than item-at-a-time so that a chain of
/// reducers can be realized either sequentially or via a parallel fold over
/// chunks of the same batch.
///
/// Departure from a literal per-message iterator adapter: chunking a `Vec`
/// by index and recombining by concatenation (the parallel-fold realization
/// in `compile::CompiledOperator::reduce_prefix`) is direct with owned
/// `Vec`s; splitting and rejoining a boxed `dyn Iterator` mid-stream across
/// worker threads would need its own buffering step anyway, so the batch
/// stays a `Vec` throughout. See `DESIGN.md`'s "Open questions / departures".
pub type ReducerFn<M> = Arc<dyn Fn(Vec<M>) -> Vec<M> + Send + Sync>;

/// Binary merge over two dereferenced snapshots, used to combine shards.
pub type CombinerFn<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

/// Post-processing transform applied when a snapshot is dereferenced.
pub type EmitterFn<V> = Arc<dyn Fn(V) -> V + Send + Sync>;

/// The wire shape of a snapshot is left abstract by the core — serializer
/// and deserializer are identity by default and operate on the same type
/// `V` rather than naming a concrete wire format.
pub type SerializerFn<V> = Arc<dyn Fn(V) -> V + Send + Sync>;
pub type DeserializerFn<V> = Arc<dyn Fn(V) -> V + Send + Sync>;

/// Runtime object that folds batches of messages into internal state.
///
/// `reducer()` is the pre-aggregation composition hook: a plain stage (built
/// by [`crate::generator::map_op`] and friends) exposes one; aggregators
/// return `None`.
pub trait StreamOperator<M>: Send + Sync {
    /// Fold a batch into internal state. For a pure reducer-backed stage
    /// this realizes the reducer and discards its output — the stage only
    /// does useful work when fused into a pre-chain ahead of an aggregator.
    fn process_all(&self, msgs: &[M]);

    /// Return to post-construction state.
    fn reset(&self);

    /// Composable transformation over messages, if this stage participates
    /// in the pre-aggregation reducer chain.
    fn reducer(&self) -> Option<ReducerFn<M>> {
        None
    }

    /// Expose this operator's flush capability without requiring trait
    /// object upcasting (stable only since Rust 1.86): concrete types that
    /// are also [`Flushable`] override this to return `Some(self)`.
    fn as_flushable(&self) -> Option<&dyn Flushable> {
        None
    }
}

/// A barrier operation: force any buffered state downstream. Kept as its own
/// minimal trait (rather than a supertrait users must upcast to) so that
/// [`StreamOperator::as_flushable`] can hand it out by reference.
pub trait Flushable: Send + Sync {
    fn flush(&self);
}

/// A [`StreamOperator`] that is also dereferenceable: it can produce a
/// snapshot view of all messages observed since the last reset.
pub trait Aggregator<M, V>: StreamOperator<M> {
    /// Current snapshot. Callers must treat the result as read-only, and
    /// should `flush()` first (via [`StreamOperator::as_flushable`]) for a
    /// view that reflects all buffered state.
    fn deref_snapshot(&self) -> V;

    /// Post-processing transform attached at instantiation time, so
    /// [`crate::compile::snapshot`] can apply it without re-consulting the
    /// generator. Identity by default; `create()` implementations that carry
    /// a non-identity emitter stamp it onto the returned operator via
    /// [`EmittingAggregator`].
    fn emitter(&self) -> EmitterFn<V> {
        Arc::new(|v| v)
    }

    /// Wire encoder for this snapshot, attached at instantiation the same
    /// way as [`Aggregator::emitter`]. Identity by default.
    fn serializer(&self) -> SerializerFn<V> {
        Arc::new(|v| v)
    }

    /// Wire decoder, the dual of [`Aggregator::serializer`].
    fn deserializer(&self) -> DeserializerFn<V> {
        Arc::new(|v| v)
    }
}

/// Wraps an [`Aggregator`] to override its ambient `emitter`/`serializer`/
/// `deserializer`, delegating everything else (including `Flushable`) to the
/// inner operator. Used by `create()` implementations to stamp a
/// generator-computed transform onto the operator they return, so a caller
/// holding only the operator (not the generator) can still apply it.
pub struct EmittingAggregator<M, V> {
    inner: Arc<dyn Aggregator<M, V>>,
    emitter: EmitterFn<V>,
    serializer: SerializerFn<V>,
    deserializer: DeserializerFn<V>,
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> EmittingAggregator<M, V> {
    pub fn new(inner: Arc<dyn Aggregator<M, V>>, emitter: EmitterFn<V>) -> Self {
        let serializer = inner.serializer();
        let deserializer = inner.deserializer();
        Self { inner, emitter, serializer, deserializer }
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> StreamOperator<M>
    for EmittingAggregator<M, V>
{
    fn process_all(&self, msgs: &[M]) {
        self.inner.process_all(msgs);
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn reducer(&self) -> Option<ReducerFn<M>> {
        self.inner.reducer()
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        self.inner.as_flushable()
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> Aggregator<M, V>
    for EmittingAggregator<M, V>
{
    fn deref_snapshot(&self) -> V {
        self.inner.deref_snapshot()
    }

    fn emitter(&self) -> EmitterFn<V> {
        self.emitter.clone()
    }

    fn serializer(&self) -> SerializerFn<V> {
        self.serializer.clone()
    }

    fn deserializer(&self) -> DeserializerFn<V> {
        self.deserializer.clone()
    }
}

/// An [`Aggregator`] refined with a cheap, single-message entry point and an
/// explicit flush. `process_one` defaults to `process_all(&[msg])`; the
/// buffered-aggregator adapter overrides it to be non-blocking.
pub trait BufferedAggregator<M, V>: Aggregator<M, V> {
    fn process_one(&self, msg: M) {
        self.process_all(std::slice::from_ref(&msg));
    }

    fn flush_now(&self);
}

/// Builds a stateless pre-aggregation stage described entirely by a reducer.
/// Has no state of its own beyond an optional reset hook:
/// processing a batch directly just realizes the reducer and drops the
/// output, since useful work only happens once this stage is fused ahead of
/// an aggregator.
pub struct ClosureProcessor<M: Clone> {
    reducer: ReducerFn<M>,
    reset_fn: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<M: Clone + Send + Sync + 'static> ClosureProcessor<M> {
    pub fn new(reducer: ReducerFn<M>, reset_fn: Option<Arc<dyn Fn() + Send + Sync>>) -> Self {
        Self { reducer, reset_fn }
    }
}

impl<M: Clone + Send + Sync + 'static> StreamOperator<M> for ClosureProcessor<M> {
    fn process_all(&self, msgs: &[M]) {
        let _ = (self.reducer)(msgs.to_vec());
    }

    fn reset(&self) {
        if let Some(f) = &self.reset_fn {
            f();
        }
    }

    fn reducer(&self) -> Option<ReducerFn<M>> {
        Some(self.reducer.clone())
    }
}

/// A stateful sink (`stream_aggregator`). `process` is authoritative; the
/// single-message entry point is defined in terms of it.
pub struct ClosureAggregator<M, V> {
    lock: Mutex<()>,
    process: Arc<dyn Fn(&[M]) + Send + Sync>,
    deref_fn: Arc<dyn Fn() -> V + Send + Sync>,
    reset_fn: Option<Arc<dyn Fn() + Send + Sync>>,
    flush_fn: Option<Arc<dyn Fn() + Send + Sync>>,
    _marker: PhantomData<M>,
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> ClosureAggregator<M, V> {
    pub fn new(
        process: Arc<dyn Fn(&[M]) + Send + Sync>,
        deref_fn: Arc<dyn Fn() -> V + Send + Sync>,
        reset_fn: Option<Arc<dyn Fn() + Send + Sync>>,
        flush_fn: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            lock: Mutex::new(()),
            process,
            deref_fn,
            reset_fn,
            flush_fn,
            _marker: PhantomData,
        }
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> StreamOperator<M>
    for ClosureAggregator<M, V>
{
    fn process_all(&self, msgs: &[M]) {
        let _guard = self.lock.lock();
        (self.process)(msgs);
    }

    fn reset(&self) {
        if let Some(f) = &self.reset_fn {
            f();
        }
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> Aggregator<M, V>
    for ClosureAggregator<M, V>
{
    fn deref_snapshot(&self) -> V {
        (self.deref_fn)()
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> Flushable for ClosureAggregator<M, V> {
    fn flush(&self) {
        if let Some(f) = &self.flush_fn {
            f();
        }
    }
}

/// `stream_processor(reducer, reset?)`.
pub fn stream_processor<M: Clone + Send + Sync + 'static>(
    reducer: ReducerFn<M>,
    reset_fn: Option<Arc<dyn Fn() + Send + Sync>>,
) -> Arc<ClosureProcessor<M>> {
    Arc::new(ClosureProcessor::new(reducer, reset_fn))
}

/// `stream_aggregator(process, deref, reset?, flush?)`. `process` and
/// `deref` are the two required callbacks; omitting either is a usage error
/// caught here rather than surfacing as a panic deeper in the pipeline.
pub fn stream_aggregator<M: Send + Sync + 'static, V: Send + Sync + 'static>(
    process: Option<Arc<dyn Fn(&[M]) + Send + Sync>>,
    deref_fn: Option<Arc<dyn Fn() -> V + Send + Sync>>,
    reset_fn: Option<Arc<dyn Fn() + Send + Sync>>,
    flush_fn: Option<Arc<dyn Fn() + Send + Sync>>,
) -> Result<Arc<ClosureAggregator<M, V>>, UsageError> {
    let process = process.ok_or(UsageError::MissingProcess)?;
    let deref_fn = deref_fn.ok_or(UsageError::MissingDeref)?;
    Ok(Arc::new(ClosureAggregator::new(process, deref_fn, reset_fn, flush_fn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_aggregator_requires_process() {
        let err = stream_aggregator::<i32, i32>(None, Some(Arc::new(|| 0)), None, None)
            .expect_err("missing process callback must be rejected");
        assert!(matches!(err, UsageError::MissingProcess));
    }

    #[test]
    fn stream_aggregator_requires_deref() {
        let err = stream_aggregator::<i32, i32>(Some(Arc::new(|_msgs: &[i32]| {})), None, None, None)
            .expect_err("missing deref callback must be rejected");
        assert!(matches!(err, UsageError::MissingDeref));
    }

    #[test]
    fn stream_aggregator_with_both_callbacks_succeeds() {
        let agg = stream_aggregator::<i32, i32>(
            Some(Arc::new(|_msgs: &[i32]| {})),
            Some(Arc::new(|| 7)),
            None,
            None,
        )
        .unwrap();
        assert_eq!(agg.deref_snapshot(), 7);
    }

    #[test]
    fn emitting_aggregator_stamps_emitter_and_delegates_snapshot() {
        let inner: Arc<dyn Aggregator<i32, i32>> = stream_aggregator::<i32, i32>(
            Some(Arc::new(|_msgs: &[i32]| {})),
            Some(Arc::new(|| 5)),
            None,
            None,
        )
        .unwrap();
        let doubled: EmitterFn<i32> = Arc::new(|v| v * 2);
        let wrapped = EmittingAggregator::new(inner, doubled);
        assert_eq!(wrapped.deref_snapshot(), 5);
        assert_eq!((wrapped.emitter())(wrapped.deref_snapshot()), 10);
    }
}
