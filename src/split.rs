//! Split: fan-out to a named map of compiled sub-pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::descriptor::Descriptor;
use crate::error::CompileError;
use crate::generator::{CreatedOperator, OperatorGenerator, StageLabel};
use crate::operator::{Aggregator, CombinerFn, EmitterFn, Flushable, StreamOperator};
use crate::options::CreateOptions;

/// Stable, monotonically increasing affinity source used to tag
/// non-concurrent split branches with a shard-stable (if not
/// cryptographically random) execution affinity — see `DESIGN.md` for why a
/// counter stands in for picking a random affinity value.
static NEXT_AFFINITY: AtomicU64 = AtomicU64::new(0);

pub struct SplitOperator<M, V> {
    children: FxHashMap<String, Arc<dyn Aggregator<M, V>>>,
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> StreamOperator<M> for SplitOperator<M, V> {
    fn process_all(&self, msgs: &[M]) {
        for child in self.children.values() {
            child.process_all(msgs);
        }
    }

    fn reset(&self) {
        for child in self.children.values() {
            child.reset();
        }
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> Aggregator<M, FxHashMap<String, V>>
    for SplitOperator<M, V>
{
    fn deref_snapshot(&self) -> FxHashMap<String, V> {
        self.children
            .iter()
            .map(|(k, v)| (k.clone(), v.deref_snapshot()))
            .collect()
    }
}

impl<M: Send + Sync + 'static, V: Send + Sync + 'static> Flushable for SplitOperator<M, V> {
    fn flush(&self) {
        for child in self.children.values() {
            if let Some(f) = child.as_flushable() {
                f.flush();
            }
        }
    }
}

/// `split({k -> sub-generator})`. Each `sub-generator` is assumed already
/// compiled (a single aggregator per branch), as produced by
/// [`crate::compile::compile`] over the branch's descriptor.
pub struct SplitGenerator<M, V> {
    children: FxHashMap<String, Arc<dyn OperatorGenerator<M, V>>>,
}

impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> SplitGenerator<M, V> {
    pub fn new(children: FxHashMap<String, Arc<dyn OperatorGenerator<M, V>>>) -> Self {
        Self { children }
    }

    /// The static key set, exposed for introspection so tooling can list
    /// branch names without instantiating the split.
    pub fn keys(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn build_combiner(&self) -> Option<CombinerFn<FxHashMap<String, V>>> {
        let mut combiners = FxHashMap::default();
        for (k, g) in &self.children {
            combiners.insert(k.clone(), g.combiner()?);
        }
        let combiners = Arc::new(combiners);
        Some(Arc::new(move |mut a: FxHashMap<String, V>, b: FxHashMap<String, V>| {
            let mut out = FxHashMap::default();
            for (k, cf) in combiners.iter() {
                // Keys missing from either side are sentinel-filtered out of
                // the merged result rather than erroring; see DESIGN.md.
                if let (Some(av), Some(bv)) = (a.remove(k), b.get(k)) {
                    out.insert(k.clone(), cf(av, bv.clone()));
                }
            }
            out
        }))
    }

    fn build_emitter(&self) -> EmitterFn<FxHashMap<String, V>> {
        let emitters: FxHashMap<String, EmitterFn<V>> = self
            .children
            .iter()
            .map(|(k, g)| (k.clone(), g.emitter()))
            .collect();
        Arc::new(move |snapshot: FxHashMap<String, V>| {
            snapshot
                .into_iter()
                .map(|(k, v)| {
                    let v = emitters.get(&k).map(|e| e(v.clone())).unwrap_or(v);
                    (k, v)
                })
                .collect()
        })
    }
}

impl<M: Send + Sync + 'static, V: Clone + Send + Sync + 'static> OperatorGenerator<M, FxHashMap<String, V>>
    for SplitGenerator<M, V>
{
    fn is_aggregator(&self) -> bool {
        true
    }

    fn is_concurrent(&self) -> bool {
        self.children.values().all(|g| g.is_concurrent())
    }

    fn combiner(&self) -> Option<CombinerFn<FxHashMap<String, V>>> {
        self.build_combiner()
    }

    fn emitter(&self) -> EmitterFn<FxHashMap<String, V>> {
        self.build_emitter()
    }

    fn descriptor(&self) -> Vec<StageLabel> {
        let mut branches: Vec<(String, Vec<StageLabel>)> = self
            .children
            .iter()
            .map(|(k, g)| (k.clone(), g.descriptor()))
            .collect();
        branches.sort_by(|a, b| a.0.cmp(&b.0));
        vec![StageLabel::Split(branches)]
    }

    fn create(
        &self,
        options: &CreateOptions<M, FxHashMap<String, V>>,
    ) -> CreatedOperator<M, FxHashMap<String, V>> {
        let mut children = FxHashMap::default();
        for (k, g) in &self.children {
            let branch_options = if g.is_concurrent() {
                options_for_branch(options, None)
            } else {
                let affinity = NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed);
                options_for_branch(options, Some(affinity))
            };
            let created = g.create(&branch_options);
            let CreatedOperator::Aggregator(agg) = created else {
                unreachable!("split branch generators are always compiled aggregators")
            };
            children.insert(k.clone(), agg);
        }
        CreatedOperator::Aggregator(Arc::new(SplitOperator { children }))
    }
}

/// Split forwards a subset of the outer options (affinity, executor) down to
/// each branch; the per-key wrapper hooks are intentionally not forwarded —
/// they apply to the split as a whole, not to individual branches.
fn options_for_branch<M, V>(
    outer: &CreateOptions<M, FxHashMap<String, V>>,
    affinity: Option<u64>,
) -> CreateOptions<M, V> {
    CreateOptions {
        aggregator_generator_wrapper: None,
        compiled_operator_wrapper: None,
        execution_affinity: affinity,
        executor: outer.executor.clone(),
        serialize: None,
        deserialize: None,
    }
}

/// `split({k -> sub-descriptor})`: compile each branch descriptor
/// independently (each must resolve to a single aggregator) and fan them out
/// under a [`SplitGenerator`].
/// This is where a `Split` fits into the descriptor algebra: build it here,
/// then drop the result into a surrounding [`crate::descriptor::Descriptor`]
/// like any other generator.
pub fn split_descriptors<M, V>(
    branches: FxHashMap<String, Descriptor<M, V>>,
) -> Result<Arc<SplitGenerator<M, V>>, CompileError>
where
    M: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    if branches.is_empty() {
        return Err(CompileError::EmptySplit);
    }
    let mut children = FxHashMap::default();
    for (key, descriptor) in branches {
        let compiled = crate::compile::compile_with(descriptor)?;
        children.insert(key, compiled as Arc<dyn OperatorGenerator<M, V>>);
    }
    Ok(Arc::new(SplitGenerator::new(children)))
}
