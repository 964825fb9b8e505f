//! The monoid aggregator: a generic aggregator built from `initial`/`combine`,
//! optionally preceded by a per-message `pre_process`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::generator::AggregatorGenerator;
use crate::operator::{
    Aggregator, CombinerFn, DeserializerFn, EmitterFn, Flushable, SerializerFn, StreamOperator,
};
use crate::options::CreateOptions;

/// Runtime monoid aggregator. Each shard holds a mutable cell initialized to
/// `initial()`; `process` folds a batch through `pre_process` (or identity)
/// and merges it into the cell via `combine`.
pub struct MonoidAggregatorOperator<M, V> {
    cell: Mutex<V>,
    initial: Arc<dyn Fn() -> V + Send + Sync>,
    combine: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    pre_process: Arc<dyn Fn(&M) -> V + Send + Sync>,
    clear_on_reset: bool,
    serialize: Option<SerializerFn<V>>,
    deserialize: Option<DeserializerFn<V>>,
}

impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> MonoidAggregatorOperator<M, V> {
    fn new(
        initial: Arc<dyn Fn() -> V + Send + Sync>,
        combine: Arc<dyn Fn(V, V) -> V + Send + Sync>,
        pre_process: Arc<dyn Fn(&M) -> V + Send + Sync>,
        clear_on_reset: bool,
        serialize: Option<SerializerFn<V>>,
        deserialize: Option<DeserializerFn<V>>,
    ) -> Self {
        let start = initial();
        Self {
            cell: Mutex::new(start),
            initial,
            combine,
            pre_process,
            clear_on_reset,
            serialize,
            deserialize,
        }
    }
}

impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> StreamOperator<M>
    for MonoidAggregatorOperator<M, V>
{
    fn process_all(&self, msgs: &[M]) {
        let folded = msgs
            .iter()
            .map(|m| (self.pre_process)(m))
            .fold((self.initial)(), |acc, v| (self.combine)(acc, v));
        let mut cell = self.cell.lock();
        let current = std::mem::replace(&mut *cell, (self.initial)());
        *cell = (self.combine)(current, folded);
    }

    fn reset(&self) {
        if self.clear_on_reset {
            *self.cell.lock() = (self.initial)();
        }
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> Aggregator<M, V>
    for MonoidAggregatorOperator<M, V>
{
    fn deref_snapshot(&self) -> V {
        self.cell.lock().clone()
    }

    fn serializer(&self) -> SerializerFn<V> {
        self.serialize.clone().unwrap_or_else(|| Arc::new(|v| v))
    }

    fn deserializer(&self) -> DeserializerFn<V> {
        self.deserialize.clone().unwrap_or_else(|| Arc::new(|v| v))
    }
}

/// Monoid aggregators have nothing buffered internally to flush; `flush` is
/// a no-op so the type can still participate in barrier forwarding uniformly.
impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> Flushable
    for MonoidAggregatorOperator<M, V>
{
    fn flush(&self) {}
}

/// `monoid(initial, combine, pre_process?, emit?, clear_on_reset?)`.
/// `combine` doubles as the generator-level shard-merge combiner.
/// `clear_on_reset` defaults to `true`; pass `false` for a monoid whose cell
/// should survive a `reset()` call (e.g. a running total that only the
/// combiner, not the caller, ever zeroes).
pub fn monoid<M, V>(
    initial: impl Fn() -> V + Send + Sync + 'static,
    combine: impl Fn(V, V) -> V + Send + Sync + 'static,
    pre_process: impl Fn(&M) -> V + Send + Sync + 'static,
    emit: Option<EmitterFn<V>>,
    clear_on_reset: bool,
) -> Arc<AggregatorGenerator<M, V>>
where
    M: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let initial = Arc::new(initial);
    let combine = Arc::new(combine);
    let pre_process = Arc::new(pre_process);

    let combiner: CombinerFn<V> = {
        let combine = combine.clone();
        Arc::new(move |a, b| combine(a, b))
    };

    let create_fn = {
        let initial = initial.clone();
        let combine = combine.clone();
        let pre_process = pre_process.clone();
        Arc::new(move |opts: &CreateOptions<M, V>| {
            Arc::new(MonoidAggregatorOperator::new(
                initial.clone(),
                combine.clone(),
                pre_process.clone(),
                clear_on_reset,
                opts.serialize.clone(),
                opts.deserialize.clone(),
            )) as Arc<dyn Aggregator<M, V>>
        })
    };

    Arc::new(AggregatorGenerator::new(
        "monoid",
        true,
        Some(combiner),
        emit,
        create_fn,
    ))
}

/// Convenience constructor for the common case where messages are already
/// the accumulated value type (e.g. `monoid(initial=0, combine=+)` over
/// pre-mapped numbers).
pub fn monoid_identity<V>(
    initial: impl Fn() -> V + Send + Sync + 'static,
    combine: impl Fn(V, V) -> V + Send + Sync + 'static,
) -> Arc<AggregatorGenerator<V, V>>
where
    V: Clone + Send + Sync + 'static,
{
    monoid(initial, combine, |m: &V| m.clone(), None, true)
}
