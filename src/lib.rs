//! A compositional stream analysis engine: an operator algebra (processors
//! and aggregators), a compiler that fuses a descriptor into one runtime
//! object, and a worker-pool execution substrate that lets an aggregator's
//! `process` calls get batched and pushed off the caller's thread.
//!
//! Start at [`compile`] (or [`compile_with`] for a pipeline whose snapshot
//! type isn't the default `Vec<M>`) to turn a [`Descriptor`] into a
//! ready-to-use [`OperatorGenerator`]; `generator.create(&CreateOptions::default())`
//! then gives you the live [`Aggregator`] to `process_all`/`deref_snapshot`
//! against.

pub mod accumulator;
pub mod buffered;
pub mod compile;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod generator;
pub mod monoid;
pub mod operator;
pub mod options;
pub mod split;

pub use accumulator::accumulator;
pub use buffered::{buffered, buffered_with_capacity};
pub use compile::{compile, compile_with, compile_with_post, snapshot};
pub use descriptor::{generator_factory, Descriptor, DescriptorElement, GeneratorFactory};
pub use error::{CompileError, ExecutorError, UsageError};
pub use executor::{current_task, inside_exclusive_lock, Executor, TaskId};
pub use generator::{map_op, mapcat_op, reducer_op, CreatedOperator, OperatorGenerator, StageLabel};
pub use monoid::{monoid, monoid_identity};
pub use operator::{
    Aggregator, BufferedAggregator, Flushable, StreamOperator, stream_aggregator, stream_processor,
};
pub use options::CreateOptions;
pub use split::{split_descriptors, SplitGenerator};
