//! The compilation pipeline: normalize a descriptor down to an element list,
//! partition it into a pre-aggregation processor chain plus a single
//! terminal aggregator (auto-appending `accumulator()` when the output type
//! is the default `Vec<M>` and none is present), fuse the
//! concurrency/combiner/emitter metadata of the whole chain, and hand back
//! one `OperatorGenerator` ready to `create`.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::accumulator::accumulator;
use crate::descriptor::{Descriptor, DescriptorElement};
use crate::error::CompileError;
use crate::executor::Executor;
use crate::generator::{self, CreatedOperator, OperatorGenerator, StageLabel};
use crate::operator::{
    Aggregator, CombinerFn, DeserializerFn, EmitterFn, EmittingAggregator, Flushable, ReducerFn,
    SerializerFn, StreamOperator,
};
use crate::options::CreateOptions;

/// Resolve one descriptor element to a concrete generator: factories are
/// invoked, plain functions become processor generators, generators pass
/// through unchanged.
fn resolve_element<M, V>(
    element: DescriptorElement<M, V>,
) -> Arc<dyn OperatorGenerator<M, V>>
where
    M: Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    match element {
        DescriptorElement::Generator(g) => g,
        DescriptorElement::Factory(f) => f.call(),
        DescriptorElement::Map(f) => generator::map_op(move |m: M| (f)(m)),
    }
}

/// Compile a descriptor whose last element is already an aggregator
/// generator. Use this entry point when compiling a `split` branch or any
/// pipeline whose snapshot type isn't the default `Vec<M>` — see [`compile`]
/// for the auto-appending convenience wrapper, or [`compile_with_post`] to
/// additionally fuse reducers after the aggregator into the emit path.
pub fn compile_with<M, V>(
    descriptor: Descriptor<M, V>,
) -> Result<Arc<dyn OperatorGenerator<M, V>>, CompileError>
where
    M: Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let elements: Vec<Arc<dyn OperatorGenerator<M, V>>> = descriptor
        .into_elements()
        .into_iter()
        .map(resolve_element)
        .collect();
    build(elements, Vec::new())
}

/// Compile a descriptor, auto-appending [`accumulator`] as the terminal
/// aggregator when none is present. This is the common entry point: most
/// descriptors either end in an explicit aggregator or want the default
/// "collect everything" behavior.
pub fn compile<M>(
    descriptor: Descriptor<M, Vec<M>>,
) -> Result<Arc<dyn OperatorGenerator<M, Vec<M>>>, CompileError>
where
    M: Clone + Send + Sync + 'static,
{
    let mut elements: Vec<Arc<dyn OperatorGenerator<M, Vec<M>>>> = descriptor
        .into_elements()
        .into_iter()
        .map(resolve_element)
        .collect();
    if !elements.iter().any(|g| g.is_aggregator()) {
        elements.push(accumulator::<M>() as Arc<dyn OperatorGenerator<M, Vec<M>>>);
    }
    build(elements, Vec::new())
}

/// Compile a descriptor whose elements end in an aggregator followed by one
/// or more reducers over the snapshot type `V` — the post-aggregation
/// chain. At emit time, the composed transform is
/// `x -> postChain([aggr.emitter(x)])[0]`: the aggregator's own emitter runs
/// first, then each post-stage reducer in turn (leftmost acts first on the
/// snapshot), and the single resulting value is taken back out of the
/// one-element batch. Post stages never see individual messages — only the
/// aggregator's (already-emitted) snapshot — so they're themselves
/// `OperatorGenerator<V, V>`, not `OperatorGenerator<M, V>`.
pub fn compile_with_post<M, V>(
    descriptor: Descriptor<M, V>,
    post: Vec<DescriptorElement<V, V>>,
) -> Result<Arc<dyn OperatorGenerator<M, V>>, CompileError>
where
    M: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let elements: Vec<Arc<dyn OperatorGenerator<M, V>>> = descriptor
        .into_elements()
        .into_iter()
        .map(resolve_element)
        .collect();
    let post: Vec<Arc<dyn OperatorGenerator<V, V>>> = post.into_iter().map(resolve_element).collect();
    build(elements, post)
}

/// Dereference `operator`'s snapshot with the emitter that was stamped onto
/// it at instantiation applied — the read-side counterpart to `create`.
/// Equivalent to calling the generator's own `emitter()` and applying it to
/// `deref_snapshot()`, but works from the operator alone since `create()`
/// already carries the transform forward onto the returned operator (see
/// [`EmittingAggregator`]).
pub fn snapshot<M, V>(operator: &Arc<dyn Aggregator<M, V>>) -> V {
    (operator.emitter())(operator.deref_snapshot())
}

fn build<M, V>(
    mut elements: Vec<Arc<dyn OperatorGenerator<M, V>>>,
    post: Vec<Arc<dyn OperatorGenerator<V, V>>>,
) -> Result<Arc<dyn OperatorGenerator<M, V>>, CompileError>
where
    M: Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // Idempotency: compiling an already-compiled generator alone is a no-op.
    if elements.len() == 1 && post.is_empty() && elements[0].is_compiled() {
        return Ok(elements.remove(0));
    }

    let agg_idx = elements
        .iter()
        .position(|g| g.is_aggregator())
        .ok_or(CompileError::MissingAggregator)?;
    if agg_idx + 1 != elements.len() {
        // A descriptor admits at most one aggregator among its M-typed
        // elements, and it must be last; any reducers meant to run after it
        // belong in `post` (they operate on `V`, not `M`).
        return Err(CompileError::UnrecognizedElement);
    }
    let aggregator = elements.remove(agg_idx);
    let pre = elements;

    // Post-stage generators are instantiated once here, at compile time,
    // purely to extract their stateless reducer: the composed emit function
    // this produces is generator-level metadata (`emitter()` takes no
    // `CreateOptions`), not something rebuilt per `create()` call.
    let mut post_reducers: Vec<ReducerFn<V>> = Vec::with_capacity(post.len());
    for g in &post {
        if g.is_aggregator() {
            return Err(CompileError::UnrecognizedElement);
        }
        let created = g.create(&CreateOptions::default());
        let reducer = match created {
            CreatedOperator::Processor(p) => match p.reducer() {
                Some(r) => r,
                None => {
                    let p2 = p.clone();
                    Arc::new(move |vals: Vec<V>| {
                        p2.process_all(&vals);
                        vals
                    }) as ReducerFn<V>
                }
            },
            CreatedOperator::Aggregator(_) => {
                unreachable!("post-chain generators are rejected above when is_aggregator() is true")
            }
        };
        post_reducers.push(reducer);
    }

    let mut descriptor_labels = Vec::new();
    for g in &pre {
        descriptor_labels.extend(g.descriptor());
    }
    descriptor_labels.extend(aggregator.descriptor());
    for g in &post {
        descriptor_labels.extend(g.descriptor());
    }

    // Fusion: the compiled pipeline is concurrent only if every prefix stage
    // *and* the aggregator are; its combiner is only
    // meaningful when the whole prefix is concurrent (otherwise shards
    // would disagree about how the prefix was applied).
    let pre_concurrent = pre.iter().all(|g| g.is_concurrent());
    let fused_concurrent = pre_concurrent && aggregator.is_concurrent();

    tracing::debug!(
        pre_stages = pre.len(),
        post_stages = post_reducers.len(),
        concurrent = fused_concurrent,
        "compiled stream pipeline"
    );

    Ok(Arc::new(CompiledGenerator {
        pre,
        aggregator,
        post_reducers,
        descriptor_labels,
        pre_concurrent,
        fused_concurrent,
    }))
}

/// The output of [`compile`]/[`compile_with`]/[`compile_with_post`]: static
/// metadata fused from the whole chain, plus enough of the original
/// generator list to instantiate a fresh [`CompiledOperator`] on every
/// `create` call.
struct CompiledGenerator<M, V> {
    pre: Vec<Arc<dyn OperatorGenerator<M, V>>>,
    aggregator: Arc<dyn OperatorGenerator<M, V>>,
    post_reducers: Vec<ReducerFn<V>>,
    descriptor_labels: Vec<StageLabel>,
    pre_concurrent: bool,
    fused_concurrent: bool,
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> OperatorGenerator<M, V>
    for CompiledGenerator<M, V>
{
    fn is_aggregator(&self) -> bool {
        true
    }

    fn is_concurrent(&self) -> bool {
        self.fused_concurrent
    }

    fn combiner(&self) -> Option<CombinerFn<V>> {
        if self.pre_concurrent { self.aggregator.combiner() } else { None }
    }

    fn emitter(&self) -> EmitterFn<V> {
        let aggregator_emitter = self.aggregator.emitter();
        if self.post_reducers.is_empty() {
            return aggregator_emitter;
        }
        let post_reducers = self.post_reducers.clone();
        Arc::new(move |v: V| {
            let emitted = aggregator_emitter(v);
            let batch = post_reducers.iter().fold(vec![emitted], |acc, r| r(acc));
            batch
                .into_iter()
                .next()
                .expect("post chain reducers must not empty the single-element batch")
        })
    }

    fn serializer(&self) -> SerializerFn<V> {
        self.aggregator.serializer()
    }

    fn deserializer(&self) -> DeserializerFn<V> {
        self.aggregator.deserializer()
    }

    fn recur_to(&self, outer: std::sync::Weak<dyn OperatorGenerator<M, V>>) {
        self.aggregator.recur_to(outer);
    }

    fn descriptor(&self) -> Vec<StageLabel> {
        self.descriptor_labels.clone()
    }

    fn is_compiled(&self) -> bool {
        true
    }

    fn create(&self, options: &CreateOptions<M, V>) -> CreatedOperator<M, V> {
        tracing::debug!(
            pre_stages = self.pre.len(),
            concurrent = self.fused_concurrent,
            "instantiating compiled stream pipeline"
        );
        let mut pre_ops: Vec<Arc<dyn StreamOperator<M>>> = Vec::with_capacity(self.pre.len());
        let mut reducers: Vec<ReducerFn<M>> = Vec::with_capacity(self.pre.len());
        for gen in &self.pre {
            let op = match gen.create(options) {
                CreatedOperator::Processor(p) => p,
                CreatedOperator::Aggregator(_) => {
                    unreachable!("pre-chain generators are never aggregators, enforced at compile time")
                }
            };
            let reducer = match op.reducer() {
                Some(r) => r,
                None => {
                    let op2 = op.clone();
                    Arc::new(move |msgs: Vec<M>| {
                        op2.process_all(&msgs);
                        msgs
                    }) as ReducerFn<M>
                }
            };
            pre_ops.push(op);
            reducers.push(reducer);
        }
        let pre_reducer: Option<ReducerFn<M>> = if reducers.is_empty() {
            None
        } else {
            Some(Arc::new(move |msgs: Vec<M>| {
                reducers.iter().fold(msgs, |acc, r| r(acc))
            }))
        };

        let aggregator_generator = match &options.aggregator_generator_wrapper {
            Some(wrap) => wrap(self.aggregator.clone()),
            None => self.aggregator.clone(),
        };
        let inner = match aggregator_generator.create(options) {
            CreatedOperator::Aggregator(a) => a,
            CreatedOperator::Processor(_) => {
                unreachable!("the terminal element of a compiled pipeline is always an aggregator")
            }
        };

        let compiled = Arc::new(CompiledOperator {
            pre_ops,
            pre_reducer,
            executor: options.executor.clone(),
            concurrent: self.fused_concurrent,
            inner,
        }) as Arc<dyn Aggregator<M, V>>;

        // Stamp the generator's composed emit (aggregator emitter, then any
        // post chain) onto the returned operator so a caller holding only
        // the operator can still compute `snapshot()` correctly.
        let compiled = if self.post_reducers.is_empty() {
            compiled
        } else {
            Arc::new(EmittingAggregator::new(compiled, self.emitter())) as Arc<dyn Aggregator<M, V>>
        };

        let result = match &options.compiled_operator_wrapper {
            Some(wrap) => wrap(compiled, options),
            None => compiled,
        };
        CreatedOperator::Aggregator(result)
    }
}

/// The instantiated form of a compiled pipeline: the fused pre-chain reducer
/// (run sequentially, or scattered across the executor's workers and
/// gathered back when every prefix stage is concurrent and an executor is
/// available) feeding a single terminal aggregator.
struct CompiledOperator<M, V> {
    pre_ops: Vec<Arc<dyn StreamOperator<M>>>,
    pre_reducer: Option<ReducerFn<M>>,
    executor: Option<Arc<Executor>>,
    concurrent: bool,
    inner: Arc<dyn Aggregator<M, V>>,
}

/// A one-shot countdown latch used to gather scattered chunk results back on
/// the calling thread before feeding the aggregator.
struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Latch {
    fn new(n: usize) -> Self {
        Self { remaining: Mutex::new(n), done: Condvar::new() }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> CompiledOperator<M, V> {
    /// Apply the fused pre-chain reducer to `msgs`, in parallel across the
    /// executor's workers when eligible, sequentially otherwise.
    fn reduce_prefix(&self, reducer: &ReducerFn<M>, msgs: &[M]) -> Vec<M> {
        let Some(executor) = &self.executor else {
            return reducer(msgs.to_vec());
        };
        let num_workers = executor.num_workers();
        if !self.concurrent || num_workers <= 1 || msgs.len() <= 1 {
            return reducer(msgs.to_vec());
        }

        let chunk_size = msgs.len().div_ceil(num_workers);
        let chunks: Vec<Vec<M>> = msgs.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let num_chunks = chunks.len();
        if num_chunks <= 1 {
            return reducer(msgs.to_vec());
        }

        let slots: Arc<Vec<Mutex<Vec<M>>>> =
            Arc::new((0..num_chunks).map(|_| Mutex::new(Vec::new())).collect());
        let latch = Arc::new(Latch::new(num_chunks));

        for (idx, chunk) in chunks.into_iter().enumerate() {
            let reducer = reducer.clone();
            let slots = slots.clone();
            let latch = latch.clone();
            let worker = idx % num_workers;
            let submitted = executor.submit(worker, move || {
                let transformed = reducer(chunk);
                *slots[idx].lock() = transformed;
                latch.count_down();
            });
            if submitted.is_err() {
                // Submission failed before the job could run: count down
                // immediately so `wait` below doesn't hang on a chunk that
                // will never execute. The chunk's transformation is lost,
                // matching the crate's one sanctioned silent-drop path.
                latch.count_down();
            }
        }
        latch.wait();

        let mut out = Vec::with_capacity(msgs.len());
        for slot in slots.iter() {
            out.extend(std::mem::take(&mut *slot.lock()));
        }
        out
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> StreamOperator<M>
    for CompiledOperator<M, V>
{
    fn process_all(&self, msgs: &[M]) {
        match &self.pre_reducer {
            Some(reducer) => {
                let transformed = self.reduce_prefix(reducer, msgs);
                self.inner.process_all(&transformed);
            }
            None => self.inner.process_all(msgs),
        }
    }

    fn reset(&self) {
        for op in &self.pre_ops {
            op.reset();
        }
        self.inner.reset();
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> Aggregator<M, V>
    for CompiledOperator<M, V>
{
    fn deref_snapshot(&self) -> V {
        self.inner.deref_snapshot()
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
}

impl<M: Clone + Send + Sync + 'static, V: Send + Sync + 'static> Flushable
    for CompiledOperator<M, V>
{
    fn flush(&self) {
        tracing::trace!("flushing compiled stream pipeline");
        for op in &self.pre_ops {
            if let Some(f) = op.as_flushable() {
                f.flush();
            }
        }
        if let Some(f) = self.inner.as_flushable() {
            f.flush();
        }
    }
}
