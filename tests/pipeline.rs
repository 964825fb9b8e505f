//! Integration tests exercising a compiled pipeline end to end: a plain
//! map+aggregate chain, the accumulator auto-append, `split`, the buffered
//! aggregator's flush barrier, reset semantics, and the concurrency-downgrade
//! rule for a combiner-less aggregator.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use stream_analysis::accumulator::accumulator;
use stream_analysis::buffered::BufferedAggregatorAdapter;
use stream_analysis::executor::Executor;
use stream_analysis::generator::{AggregatorGenerator, CreatedOperator, OperatorGenerator};
use stream_analysis::operator::{Aggregator, BufferedAggregator, StreamOperator};
use stream_analysis::split::split_descriptors;
use stream_analysis::{
    compile, compile_with, compile_with_post, map_op, monoid, monoid_identity, snapshot,
    CreateOptions, Descriptor, DescriptorElement,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn as_aggregator<M, V>(created: CreatedOperator<M, V>) -> Arc<dyn Aggregator<M, V>> {
    match created {
        CreatedOperator::Aggregator(a) => a,
        CreatedOperator::Processor(_) => panic!("expected an aggregator"),
    }
}

#[test]
fn map_then_sum() {
    let doubled = map_op::<i64, i64>(|x| x * 2);
    let summed = monoid_identity(|| 0i64, |a, b| a + b);
    let descriptor: Descriptor<i64, i64> = Descriptor::seq(vec![
        DescriptorElement::from(doubled),
        DescriptorElement::from(summed),
    ]);

    let generator = compile_with(descriptor).unwrap();
    let op = as_aggregator(generator.create(&CreateOptions::default()));
    op.process_all(&[1, 2, 3]);
    assert_eq!(op.deref_snapshot(), 12);
}

#[test]
fn descriptor_with_no_aggregator_auto_appends_accumulator() {
    let plus_one = map_op::<i64, Vec<i64>>(|x| x + 1);
    let descriptor: Descriptor<i64, Vec<i64>> = Descriptor::single(plus_one);

    let generator = compile(descriptor).unwrap();
    let op = as_aggregator(generator.create(&CreateOptions::default()));
    op.process_all(&[1, 2, 3]);
    assert_eq!(op.deref_snapshot(), vec![2, 3, 4]);
}

#[test]
fn split_fans_out_to_independent_branches() {
    let mut branches: FxHashMap<String, Descriptor<i64, Vec<i64>>> = FxHashMap::default();
    branches.insert("raw".to_string(), Descriptor::single(accumulator::<i64>()));
    branches.insert(
        "doubled".to_string(),
        Descriptor::seq(vec![
            DescriptorElement::from(map_op::<i64, Vec<i64>>(|x| x * 2)),
            DescriptorElement::from(accumulator::<i64>()),
        ]),
    );

    let split_generator = split_descriptors(branches).unwrap();
    let op = as_aggregator(split_generator.create(&CreateOptions::default()));
    op.process_all(&[1, 2, 3]);

    let snapshot = op.deref_snapshot();
    assert_eq!(snapshot.get("raw").unwrap(), &vec![1, 2, 3]);
    assert_eq!(snapshot.get("doubled").unwrap(), &vec![2, 4, 6]);
}

#[test]
fn buffered_flush_barrier_releases_all_buffered_batches() {
    init_tracing();
    let executor = Executor::with_num_cores(2);
    let downstream = as_aggregator(accumulator::<i64>().create(&CreateOptions::default()));
    let adapter = BufferedAggregatorAdapter::new(downstream, executor, 2, Some(0));

    adapter.process_one(1);
    adapter.process_one(2);
    // Capacity is 2: this push forces the first two messages out to a
    // worker before the third can be buffered.
    adapter.process_one(3);
    adapter.flush_now();

    let mut snapshot = adapter.deref_snapshot();
    snapshot.sort();
    assert_eq!(snapshot, vec![1, 2, 3]);
}

#[test]
fn reset_clears_aggregator_state_but_not_the_pipeline_shape() {
    let descriptor: Descriptor<i64, Vec<i64>> =
        Descriptor::single(map_op::<i64, Vec<i64>>(|x| x * 10));
    let generator = compile(descriptor).unwrap();
    let op = as_aggregator(generator.create(&CreateOptions::default()));

    op.process_all(&[1, 2]);
    assert_eq!(op.deref_snapshot(), vec![10, 20]);

    op.reset();
    assert_eq!(op.deref_snapshot(), Vec::<i64>::new());

    op.process_all(&[3]);
    assert_eq!(op.deref_snapshot(), vec![30]);
}

#[test]
fn snapshot_applies_a_non_identity_emitter() {
    let scaled_sum = monoid(
        || 0i64,
        |a, b| a + b,
        |m: &i64| *m,
        Some(Arc::new(|v: i64| v * 10)),
        true,
    );
    let descriptor: Descriptor<i64, i64> = Descriptor::single(scaled_sum);

    let generator = compile_with(descriptor).unwrap();
    let op = as_aggregator(generator.create(&CreateOptions::default()));
    op.process_all(&[1, 2, 3]);

    assert_eq!(op.deref_snapshot(), 6);
    assert_eq!(snapshot(&op), 60);
}

#[test]
fn snapshot_applies_aggregator_emit_then_post_chain() {
    let doubling_sum = monoid(
        || 0i64,
        |a, b| a + b,
        |m: &i64| *m,
        Some(Arc::new(|v: i64| v * 2)),
        true,
    );
    let descriptor: Descriptor<i64, i64> = Descriptor::single(doubling_sum);
    let post = vec![DescriptorElement::from(map_op::<i64, i64>(|v| v + 1))];

    let generator = compile_with_post(descriptor, post).unwrap();
    let op = as_aggregator(generator.create(&CreateOptions::default()));
    op.process_all(&[1, 2, 3]);

    // Aggregator emit (x2) runs first, then the post-chain reducer (+1):
    // (1+2+3) * 2 + 1 = 13.
    assert_eq!(snapshot(&op), 13);
}

#[test]
fn aggregator_without_a_combiner_downgrades_to_non_concurrent() {
    let no_combiner: AggregatorGenerator<i64, i64> = AggregatorGenerator::new(
        "custom",
        true,
        None,
        None,
        Arc::new(|_opts: &CreateOptions<i64, i64>| unreachable!("never instantiated in this test")),
    );
    assert!(!no_combiner.is_concurrent());

    let with_combiner = monoid_identity(|| 0i64, |a, b| a + b);
    assert!(with_combiner.is_concurrent());
}
