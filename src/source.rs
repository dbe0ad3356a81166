//! Sources of element/context pairs.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::marker::PhantomData;

use crate::engine::{ExecutionEngine, PipelineHandle};
use crate::flow::signature::{Port, Signature};
use crate::flow::{instantiate, Link};
use crate::propagator::erased::{erase, ErasedPair};
use crate::propagator::StageDescriptor;
use crate::{FlowWithContext, PairedElement};

/// A stream of `(E, C)` pairs with flows attached to it.
///
/// Attaching a flow with [`SourceWithContext::via`] changes the emitted types
/// but runs nothing; [`SourceWithContext::run`] materializes the whole thing.
///
/// # Example
///
/// ```rust
/// use context_flow::{FlowWithContext, PairedElement, SourceWithContext, StreamEngine};
///
/// # tokio_test::block_on(async {
/// let out = SourceWithContext::from_iter(vec![
///     PairedElement::new("a", 0u64),
///     PairedElement::new("bb", 1u64),
/// ])
/// .via(FlowWithContext::create().map(|s: &str| s.len()))
/// .run(&StreamEngine::default())
/// .collect_pairs()
/// .await
/// .unwrap();
///
/// assert_eq!(out, vec![PairedElement::new(1, 0), PairedElement::new(2, 1)]);
/// # });
/// ```
pub struct SourceWithContext<E, C> {
    source: BoxStream<'static, ErasedPair>,
    origin: Port,
    links: Vec<Link>,
    _marker: PhantomData<fn() -> (E, C)>,
}

impl<E, C> SourceWithContext<E, C>
where
    E: Send + 'static,
    C: Send + 'static,
{
    /// A source emitting `pairs` in order.
    pub fn from_iter<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = PairedElement<E, C>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(pairs))
    }

    /// A source emitting whatever `pairs` yields.
    pub fn from_stream<S>(pairs: S) -> Self
    where
        S: Stream<Item = PairedElement<E, C>> + Send + 'static,
    {
        Self {
            source: pairs.map(erase).boxed(),
            origin: Port::of::<E, C>(),
            links: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Attach `flow` to the end of this source.
    pub fn via<Out, COut>(self, flow: FlowWithContext<E, C, Out, COut>) -> SourceWithContext<Out, COut>
    where
        Out: Send + 'static,
        COut: Send + 'static,
    {
        let mut links = self.links;
        links.extend(flow.into_links());
        SourceWithContext {
            source: self.source,
            origin: self.origin,
            links,
            _marker: PhantomData,
        }
    }

    /// Transform each element; contexts pass through unchanged.
    pub fn map<Out, F>(self, f: F) -> SourceWithContext<Out, C>
    where
        Out: Send + 'static,
        F: Fn(E) -> Out + Send + Sync + 'static,
    {
        self.via(FlowWithContext::<E, C, E, C>::create().map(f))
    }

    /// The propagators attached so far, in execution order.
    pub fn stages(&self) -> Vec<StageDescriptor> {
        self.links.iter().map(|link| link.descriptor().clone()).collect()
    }

    /// Materialize the source and its flows on `engine`.
    pub fn run<X>(self, engine: &X) -> PipelineHandle<E, C>
    where
        X: ExecutionEngine + ?Sized,
    {
        let signature = Signature {
            inlet: self.origin,
            outlet: Port::of::<E, C>(),
        };
        let chain = instantiate(signature, &self.links);
        PipelineHandle::new(engine.materialize(chain, self.source))
    }
}

impl<E, C> fmt::Debug for SourceWithContext<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceWithContext")
            .field("origin", &self.origin)
            .field("stages", &self.links)
            .finish()
    }
}
