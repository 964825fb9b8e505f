//! [`OperatorGenerator`] — the factory contract plus the constructor helpers
//! (`reducer_op`, `map_op`, `mapcat_op`) built on top of
//! [`crate::operator::stream_processor`].

use std::sync::Arc;

use crate::operator::{
    CombinerFn, DeserializerFn, EmitterFn, EmittingAggregator, ReducerFn, SerializerFn,
    StreamOperator,
};
use crate::options::CreateOptions;

/// What `create()` hands back: a plain processor (no snapshot) or an
/// aggregator (has one). `is_aggregator()` tells the caller which to expect.
pub enum CreatedOperator<M, V> {
    Processor(Arc<dyn StreamOperator<M>>),
    Aggregator(Arc<dyn crate::operator::Aggregator<M, V>>),
}

impl<M, V> CreatedOperator<M, V> {
    pub fn as_stream_operator(&self) -> &dyn StreamOperator<M> {
        match self {
            CreatedOperator::Processor(p) => p.as_ref(),
            CreatedOperator::Aggregator(a) => a.as_ref(),
        }
    }
}

/// One label per compiled stage, used for the introspection-facing
/// `descriptor()` summary (exercised by the auto-appended-accumulator test).
/// Closures aren't comparable in Rust, so the summary is a structural label
/// tree rather than a replay of the original descriptor values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageLabel {
    Stage(String),
    Split(Vec<(String, Vec<StageLabel>)>),
}

/// Factory describing how to instantiate an operator, plus its static
/// metadata.
pub trait OperatorGenerator<M, V>: Send + Sync {
    fn is_aggregator(&self) -> bool;

    /// Whether prefix stages built from this generator may run on worker
    /// threads. Always `false` is a safe default for novel generators.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Binary merge over dereferenced snapshots; absence downgrades the
    /// enclosing pipeline to non-concurrent.
    fn combiner(&self) -> Option<CombinerFn<V>> {
        None
    }

    /// Post-processing transform applied at dereference time. Identity by
    /// default.
    fn emitter(&self) -> EmitterFn<V> {
        Arc::new(|v| v)
    }

    fn serializer(&self) -> SerializerFn<V> {
        Arc::new(|v| v)
    }

    fn deserializer(&self) -> DeserializerFn<V> {
        Arc::new(|v| v)
    }

    /// Install a back-reference from this generator to an outer (windowing)
    /// generator. A no-op for generators with no notion of recursion.
    fn recur_to(&self, _outer: std::sync::Weak<dyn OperatorGenerator<M, V>>) {}

    /// Structural summary for introspection and testing.
    fn descriptor(&self) -> Vec<StageLabel>;

    /// Whether this generator is itself the output of [`crate::compile::compile`].
    /// Lets `compile` be idempotent without needing trait-object downcasting.
    fn is_compiled(&self) -> bool {
        false
    }

    fn create(&self, options: &CreateOptions<M, V>) -> CreatedOperator<M, V>;
}

/// Package a `create` closure together with generator metadata
/// (`stream_processor_generator`).
pub struct ProcessorGenerator<M, V> {
    concurrent: bool,
    label: String,
    create_fn: Arc<dyn Fn() -> Arc<dyn StreamOperator<M>> + Send + Sync>,
    _marker: std::marker::PhantomData<V>,
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> ProcessorGenerator<M, V> {
    pub fn new(
        label: impl Into<String>,
        concurrent: bool,
        create_fn: Arc<dyn Fn() -> Arc<dyn StreamOperator<M>> + Send + Sync>,
    ) -> Self {
        Self {
            concurrent,
            label: label.into(),
            create_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> OperatorGenerator<M, V>
    for ProcessorGenerator<M, V>
{
    fn is_aggregator(&self) -> bool {
        false
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    fn descriptor(&self) -> Vec<StageLabel> {
        vec![StageLabel::Stage(self.label.clone())]
    }

    fn create(&self, _options: &CreateOptions<M, V>) -> CreatedOperator<M, V> {
        CreatedOperator::Processor((self.create_fn)())
    }
}

/// Package a `create` closure for a stateful sink together with generator
/// metadata (`stream_aggregator_generator`).
pub struct AggregatorGenerator<M, V> {
    concurrent: bool,
    label: String,
    combiner: Option<CombinerFn<V>>,
    emitter: Option<EmitterFn<V>>,
    create_fn: Arc<dyn Fn(&CreateOptions<M, V>) -> Arc<dyn crate::operator::Aggregator<M, V>> + Send + Sync>,
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> AggregatorGenerator<M, V> {
    pub fn new(
        label: impl Into<String>,
        concurrent: bool,
        combiner: Option<CombinerFn<V>>,
        emitter: Option<EmitterFn<V>>,
        create_fn: Arc<
            dyn Fn(&CreateOptions<M, V>) -> Arc<dyn crate::operator::Aggregator<M, V>> + Send + Sync,
        >,
    ) -> Self {
        Self {
            concurrent,
            label: label.into(),
            combiner,
            emitter,
            create_fn,
        }
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> OperatorGenerator<M, V>
    for AggregatorGenerator<M, V>
{
    fn is_aggregator(&self) -> bool {
        true
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent && self.combiner.is_some()
    }

    fn combiner(&self) -> Option<CombinerFn<V>> {
        self.combiner.clone()
    }

    fn emitter(&self) -> EmitterFn<V> {
        self.emitter.clone().unwrap_or_else(|| Arc::new(|v| v))
    }

    fn descriptor(&self) -> Vec<StageLabel> {
        vec![StageLabel::Stage(self.label.clone())]
    }

    fn create(&self, options: &CreateOptions<M, V>) -> CreatedOperator<M, V> {
        let inner = (self.create_fn)(options);
        let stamped = match &self.emitter {
            Some(emitter) => {
                Arc::new(EmittingAggregator::new(inner, emitter.clone())) as Arc<dyn crate::operator::Aggregator<M, V>>
            }
            None => inner,
        };
        CreatedOperator::Aggregator(stamped)
    }
}

/// `reducer_op(f)` ≡ a concurrent processor generator wrapping a bare
/// reducer.
pub fn reducer_op<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static>(
    f: ReducerFn<M>,
) -> Arc<ProcessorGenerator<M, V>> {
    let f2 = f.clone();
    Arc::new(ProcessorGenerator::new(
        "reducer",
        true,
        Arc::new(move || crate::operator::stream_processor(f2.clone(), None) as Arc<dyn StreamOperator<M>>),
    ))
}

/// `map_op(f)` ≡ `reducer_op(map over f)`.
pub fn map_op<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static>(
    f: impl Fn(M) -> M + Send + Sync + 'static,
) -> Arc<ProcessorGenerator<M, V>> {
    let f = Arc::new(f);
    let reducer: ReducerFn<M> = Arc::new(move |msgs: Vec<M>| {
        msgs.into_iter().map(|m| f(m)).collect()
    });
    Arc::new(ProcessorGenerator::new(
        "map",
        true,
        Arc::new(move || {
            crate::operator::stream_processor(reducer.clone(), None) as Arc<dyn StreamOperator<M>>
        }),
    ))
}

/// `mapcat_op(f)` — `f` returns zero or more output messages per input
/// message (e.g. a filter implemented as a mapcat that drops unwanted
/// messages).
pub fn mapcat_op<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static, I>(
    f: impl Fn(M) -> I + Send + Sync + 'static,
) -> Arc<ProcessorGenerator<M, V>>
where
    I: IntoIterator<Item = M>,
{
    let f = Arc::new(f);
    let reducer: ReducerFn<M> = Arc::new(move |msgs: Vec<M>| {
        msgs.into_iter().flat_map(|m| f(m)).collect()
    });
    Arc::new(ProcessorGenerator::new(
        "mapcat",
        true,
        Arc::new(move || {
            crate::operator::stream_processor(reducer.clone(), None) as Arc<dyn StreamOperator<M>>
        }),
    ))
}
