//! The accumulator: a concurrent terminal aggregator that collects every
//! message seen since the last reset, in order within a shard. The compiler
//! auto-appends one when a descriptor has no aggregator.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::generator::{AggregatorGenerator, OperatorGenerator};
use crate::operator::{Aggregator, CombinerFn, DeserializerFn, Flushable, SerializerFn, StreamOperator};
use crate::options::CreateOptions;

pub struct AccumulatorOperator<M> {
    buf: Mutex<Vec<M>>,
    serialize: Option<SerializerFn<Vec<M>>>,
    deserialize: Option<DeserializerFn<Vec<M>>>,
}

impl<M> AccumulatorOperator<M> {
    fn new(serialize: Option<SerializerFn<Vec<M>>>, deserialize: Option<DeserializerFn<Vec<M>>>) -> Self {
        Self { buf: Mutex::new(Vec::new()), serialize, deserialize }
    }
}

impl<M: Clone + Send + Sync + 'static> StreamOperator<M> for AccumulatorOperator<M> {
    fn process_all(&self, msgs: &[M]) {
        let mut buf = self.buf.lock();
        buf.extend_from_slice(msgs);
    }

    fn reset(&self) {
        *self.buf.lock() = Vec::new();
    }

    fn as_flushable(&self) -> Option<&dyn Flushable> {
        Some(self)
    }
}

impl<M: Clone + Send + Sync + 'static> Aggregator<M, Vec<M>> for AccumulatorOperator<M> {
    fn deref_snapshot(&self) -> Vec<M> {
        self.buf.lock().clone()
    }

    fn serializer(&self) -> SerializerFn<Vec<M>> {
        self.serialize.clone().unwrap_or_else(|| Arc::new(|v| v))
    }

    fn deserializer(&self) -> DeserializerFn<Vec<M>> {
        self.deserialize.clone().unwrap_or_else(|| Arc::new(|v| v))
    }
}

impl<M: Clone + Send + Sync + 'static> Flushable for AccumulatorOperator<M> {
    fn flush(&self) {}
}

/// `accumulator()`. Combiner is list concatenation.
pub fn accumulator<M: Clone + Send + Sync + 'static>() -> Arc<AggregatorGenerator<M, Vec<M>>> {
    let combiner: CombinerFn<Vec<M>> = Arc::new(|mut a: Vec<M>, mut b: Vec<M>| {
        a.append(&mut b);
        a
    });
    Arc::new(AggregatorGenerator::new(
        "accumulator",
        true,
        Some(combiner),
        None,
        Arc::new(move |opts: &CreateOptions<M, Vec<M>>| {
            Arc::new(AccumulatorOperator::new(opts.serialize.clone(), opts.deserialize.clone()))
                as Arc<dyn Aggregator<M, Vec<M>>>
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_messages_in_order() {
        let op = AccumulatorOperator::<i32>::new(None, None);
        op.process_all(&[1, 2, 3]);
        op.process_all(&[4]);
        assert_eq!(op.deref_snapshot(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn reset_clears_to_empty() {
        let op = AccumulatorOperator::<i32>::new(None, None);
        op.process_all(&[1, 2, 3]);
        op.reset();
        assert_eq!(op.deref_snapshot(), Vec::<i32>::new());
    }

    #[test]
    fn combiner_concatenates_shards() {
        let gen = accumulator::<i32>();
        let combine = gen.combiner().unwrap();
        assert_eq!(combine(vec![1, 2], vec![3, 4]), vec![1, 2, 3, 4]);
    }

    #[test]
    fn create_options_serialize_overrides_default_identity() {
        let gen = accumulator::<i32>();
        let opts = CreateOptions {
            serialize: Some(Arc::new(|v: Vec<i32>| v.into_iter().map(|x| x * 100).collect())),
            ..CreateOptions::default()
        };
        let created = gen.create(&opts);
        let op = match created {
            crate::generator::CreatedOperator::Aggregator(a) => a,
            crate::generator::CreatedOperator::Processor(_) => panic!("expected an aggregator"),
        };
        op.process_all(&[1, 2]);
        assert_eq!((op.serializer())(op.deref_snapshot()), vec![100, 200]);
    }
}
