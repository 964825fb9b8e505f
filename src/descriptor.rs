//! [`Descriptor`] — the user-facing pipeline declaration. A descriptor is a
//! single element or an ordered sequence of elements. `split` fan-out is
//! expressed at the [`crate::split`] level, where each
//! branch is its own already-compiled generator (see
//! `crate::split::split_descriptors`) — a `Split` can then be dropped into a
//! descriptor like any other generator via the blanket `From<Arc<G>>` below.

use std::sync::Arc;

use crate::generator::OperatorGenerator;

/// A factory function tagged so the compiler invokes it to obtain a
/// generator, rather than treating it as a plain mapping function. The
/// distinct wrapper type *is* the tag — no runtime flag needed.
pub struct GeneratorFactory<M, V>(Arc<dyn Fn() -> Arc<dyn OperatorGenerator<M, V>> + Send + Sync>);

impl<M, V> Clone for GeneratorFactory<M, V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M, V> GeneratorFactory<M, V> {
    pub fn call(&self) -> Arc<dyn OperatorGenerator<M, V>> {
        (self.0)()
    }
}

/// Decorator that tags a factory function as a "generator-generator".
pub fn generator_factory<M, V>(
    f: impl Fn() -> Arc<dyn OperatorGenerator<M, V>> + Send + Sync + 'static,
) -> GeneratorFactory<M, V> {
    GeneratorFactory(Arc::new(f))
}

/// One admissible descriptor element: a generator, a marker-tagged factory,
/// or a unary function (= point-wise map). Anything else is a
/// [`crate::error::CompileError`].
pub enum DescriptorElement<M, V> {
    Generator(Arc<dyn OperatorGenerator<M, V>>),
    Factory(GeneratorFactory<M, V>),
    Map(Arc<dyn Fn(M) -> M + Send + Sync>),
}

impl<M, V> DescriptorElement<M, V> {
    pub fn map_fn(f: impl Fn(M) -> M + Send + Sync + 'static) -> Self {
        DescriptorElement::Map(Arc::new(f))
    }

    pub fn factory(f: GeneratorFactory<M, V>) -> Self {
        DescriptorElement::Factory(f)
    }
}

impl<M: 'static, V: 'static, G> From<Arc<G>> for DescriptorElement<M, V>
where
    G: OperatorGenerator<M, V> + ?Sized + 'static,
{
    fn from(generator: Arc<G>) -> Self {
        DescriptorElement::Generator(generator)
    }
}

/// Either a single element or an ordered sequence of elements.
pub enum Descriptor<M, V> {
    Single(DescriptorElement<M, V>),
    Sequence(Vec<DescriptorElement<M, V>>),
}

impl<M, V> Descriptor<M, V> {
    pub fn single(element: impl Into<DescriptorElement<M, V>>) -> Self {
        Descriptor::Single(element.into())
    }

    pub fn seq(elements: Vec<DescriptorElement<M, V>>) -> Self {
        Descriptor::Sequence(elements)
    }

    /// Normalize to an owned `Vec` of elements: a single element becomes a
    /// one-element sequence.
    pub fn into_elements(self) -> Vec<DescriptorElement<M, V>> {
        match self {
            Descriptor::Single(e) => vec![e],
            Descriptor::Sequence(es) => es,
        }
    }
}
