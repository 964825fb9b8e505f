//! Crate error taxonomy.

use thiserror::Error;

/// Raised synchronously from [`crate::compile::compile`] when a descriptor
/// element is not one of the admissible forms.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("descriptor element is not a generator, factory, or unary function")]
    UnrecognizedElement,
    #[error("split map must have at least one branch")]
    EmptySplit,
    #[error("descriptor has no aggregator and this compile entry point does not auto-append one")]
    MissingAggregator,
}

/// Raised when constructing a [`crate::operator::StreamOperator`] or
/// [`crate::operator::Aggregator`] without its required callbacks.
#[derive(Error, Debug, Clone)]
pub enum UsageError {
    #[error("stream_aggregator requires a `process` callback")]
    MissingProcess,
    #[error("stream_aggregator requires a `deref` callback")]
    MissingDeref,
}

/// Errors surfaced by the executor's submission path. Shard failures
/// themselves are swallowed (a panicking task is caught and logged, not
/// propagated) — this enum only covers the executor's own bookkeeping.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("worker index {0} is out of range for a pool of {1} workers")]
    WorkerIndexOutOfRange(usize, usize),
    #[error("executor is shutting down, task was not submitted")]
    ShuttingDown,
}
