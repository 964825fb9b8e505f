//! Typed `create` options. A plain struct rather than an untyped
//! `HashMap<String, Box<dyn Any>>`, in the style of `dfir_lang`'s
//! `clap`-derived config structs.

use std::sync::Arc;

use crate::executor::Executor;
use crate::generator::OperatorGenerator;
use crate::operator::{Aggregator, DeserializerFn, SerializerFn};

/// Options recognized by `create`.
pub struct CreateOptions<M, V> {
    /// Transforms the aggregator generator just before its `create` is
    /// invoked (used for decorating windowing). Identity by default.
    pub aggregator_generator_wrapper:
        Option<Arc<dyn Fn(Arc<dyn OperatorGenerator<M, V>>) -> Arc<dyn OperatorGenerator<M, V>> + Send + Sync>>,

    /// Transforms the final compiled operator, with access to these same
    /// options. Identity by default.
    pub compiled_operator_wrapper: Option<
        Arc<dyn Fn(Arc<dyn Aggregator<M, V>>, &CreateOptions<M, V>) -> Arc<dyn Aggregator<M, V>> + Send + Sync>,
    >,

    /// Integer hint injected by `split` when wrapping a non-concurrent
    /// sub-pipeline; flows into the buffered aggregator's routing hash.
    pub execution_affinity: Option<u64>,

    /// Shared worker pool a buffered aggregator dispatches flushes to. When
    /// absent, a buffered-aggregator-bearing pipeline allocates its own.
    pub executor: Option<Arc<Executor>>,

    /// Wire encoder passed through to the aggregator's `create` call,
    /// overriding its default identity serializer. Identity when absent.
    pub serialize: Option<SerializerFn<V>>,

    /// Wire decoder, the dual of `serialize`.
    pub deserialize: Option<DeserializerFn<V>>,
}

impl<M, V> Default for CreateOptions<M, V> {
    fn default() -> Self {
        Self {
            aggregator_generator_wrapper: None,
            compiled_operator_wrapper: None,
            execution_affinity: None,
            executor: None,
            serialize: None,
            deserialize: None,
        }
    }
}

impl<M, V> Clone for CreateOptions<M, V> {
    fn clone(&self) -> Self {
        Self {
            aggregator_generator_wrapper: self.aggregator_generator_wrapper.clone(),
            compiled_operator_wrapper: self.compiled_operator_wrapper.clone(),
            execution_affinity: self.execution_affinity,
            executor: self.executor.clone(),
            serialize: self.serialize.clone(),
            deserialize: self.deserialize.clone(),
        }
    }
}

impl<M, V> CreateOptions<M, V> {
    pub fn with_execution_affinity(mut self, affinity: u64) -> Self {
        self.execution_affinity = Some(affinity);
        self
    }

    pub fn with_executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_serialize(mut self, serialize: SerializerFn<V>) -> Self {
        self.serialize = Some(serialize);
        self
    }

    pub fn with_deserialize(mut self, deserialize: DeserializerFn<V>) -> Self {
        self.deserialize = Some(deserialize);
        self
    }
}
