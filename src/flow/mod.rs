//! Composable context-aware flows.
//!
//! A [`FlowWithContext`] is an immutable, ordered sequence of context
//! propagators with declared input and output element/context types. Every
//! operator returns a new flow; nothing is executed until the flow is handed
//! to an [`ExecutionEngine`].

use futures::stream::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::engine::{ExecutionEngine, PipelineHandle, StageChain};
use crate::propagator::erased::{erase, ErasedPropagator};
use crate::propagator::StageDescriptor;
use crate::stage::Transform;
use crate::{ContextPropagator, Error, Result, Stage};

pub mod signature;
pub mod untyped;

use signature::{Port, Signature};
pub use untyped::UntypedFlow;

type Spawn = Arc<dyn Fn() -> Box<dyn ErasedPropagator> + Send + Sync>;

/// One propagator slot in a flow: what it is, and how to instantiate it.
#[derive(Clone)]
pub(crate) struct Link {
    descriptor: StageDescriptor,
    signature: Signature,
    spawn: Spawn,
}

impl Link {
    fn new<In, CIn, Out, COut>(propagator: &ContextPropagator<In, CIn, Out, COut>) -> Self
    where
        In: Send + 'static,
        Out: Send + 'static,
        CIn: Send + 'static,
        COut: Send + 'static,
    {
        let template = propagator.template();
        Self {
            descriptor: propagator.descriptor(),
            signature: Signature::of::<In, CIn, Out, COut>(),
            spawn: Arc::new(move || Box::new(template.spawn()) as Box<dyn ErasedPropagator>),
        }
    }

    pub(crate) fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("descriptor", &self.descriptor)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Spawn fresh propagators for every link.
pub(crate) fn instantiate(signature: Signature, links: &[Link]) -> StageChain {
    StageChain::new(signature, links.iter().map(|link| (link.spawn)()).collect())
}

/// A pipeline of context propagators from `(In, CIn)` pairs to `(Out, COut)` pairs.
///
/// Flows are values: composing two flows produces a third and leaves the
/// originals usable. [`FlowWithContext::via`] only accepts a flow whose
/// input types are this flow's output types, so mismatches fail to compile;
/// [`FlowWithContext::try_via`] and [`UntypedFlow`] perform the same check at
/// construction time when types are only known at runtime.
///
/// # Example
///
/// ```rust
/// use context_flow::{FlowWithContext, NotUsed, PairedElement, StreamEngine};
/// use futures::stream;
///
/// # tokio_test::block_on(async {
/// let flow1: FlowWithContext<i32, NotUsed, i32, NotUsed> = FlowWithContext::create();
/// let flow2: FlowWithContext<i32, NotUsed, String, NotUsed> =
///     FlowWithContext::create().map(|x: i32| x.to_string());
/// let flow3: FlowWithContext<i32, NotUsed, String, NotUsed> = flow1.via(flow2);
///
/// let source = stream::iter(vec![PairedElement::new(1, NotUsed), PairedElement::new(2, NotUsed)]);
/// let out = flow3.materialize(&StreamEngine::default(), source).collect_pairs().await.unwrap();
/// assert_eq!(out, vec![
///     PairedElement::new("1".to_string(), NotUsed),
///     PairedElement::new("2".to_string(), NotUsed),
/// ]);
/// # });
/// ```
pub struct FlowWithContext<In, CIn, Out, COut> {
    links: Vec<Link>,
    _marker: PhantomData<fn(In, CIn) -> (Out, COut)>,
}

impl<In, CIn, Out, COut> Clone for FlowWithContext<In, CIn, Out, COut> {
    fn clone(&self) -> Self {
        Self {
            links: self.links.clone(),
            _marker: PhantomData,
        }
    }
}

impl<In, CIn, Out, COut> fmt::Debug for FlowWithContext<In, CIn, Out, COut>
where
    In: 'static,
    CIn: 'static,
    Out: 'static,
    COut: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowWithContext")
            .field("signature", &Signature::of::<In, CIn, Out, COut>())
            .field("stages", &self.links)
            .finish()
    }
}

impl<T, C> FlowWithContext<T, C, T, C> {
    /// The identity flow: pairs pass through untouched.
    pub fn create() -> Self {
        Self::from_links(Vec::new())
    }
}

impl<T, C> Default for FlowWithContext<T, C, T, C> {
    fn default() -> Self {
        Self::create()
    }
}

impl<In, CIn, Out, COut> FlowWithContext<In, CIn, Out, COut> {
    pub(crate) fn from_links(links: Vec<Link>) -> Self {
        Self {
            links,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_links(self) -> Vec<Link> {
        self.links
    }

    /// Number of propagators in the flow.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether this is an identity flow.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The propagators in execution order.
    pub fn stages(&self) -> Vec<StageDescriptor> {
        self.links.iter().map(|link| link.descriptor().clone()).collect()
    }
}

impl<In, CIn, Out, COut> FlowWithContext<In, CIn, Out, COut>
where
    In: Send + 'static,
    CIn: Send + 'static,
    Out: Send + 'static,
    COut: Send + 'static,
{
    /// A single-propagator flow.
    pub fn from_propagator(propagator: ContextPropagator<In, CIn, Out, COut>) -> Self {
        Self::from_links(vec![Link::new(&propagator)])
    }

    /// The declared input and output types.
    pub fn signature(&self) -> Signature {
        Signature::of::<In, CIn, Out, COut>()
    }

    /// Append `next`, whose input types are this flow's output types.
    pub fn via<Out2, COut2>(self, next: FlowWithContext<Out, COut, Out2, COut2>) -> FlowWithContext<In, CIn, Out2, COut2>
    where
        Out2: Send + 'static,
        COut2: Send + 'static,
    {
        trace!(upstream = self.len(), downstream = next.len(), "composing flows");
        let mut links = self.links;
        links.extend(next.links);
        FlowWithContext::from_links(links)
    }

    /// Append a flow whose types are only checked at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompositionType`] when `next` does not consume
    /// `(Out, COut)`. Nothing is materialized in that case.
    pub fn try_via<In2, CIn2, Out2, COut2>(
        self,
        next: FlowWithContext<In2, CIn2, Out2, COut2>,
    ) -> Result<FlowWithContext<In, CIn, Out2, COut2>>
    where
        In2: Send + 'static,
        CIn2: Send + 'static,
        Out2: Send + 'static,
        COut2: Send + 'static,
    {
        let upstream = Port::of::<Out, COut>();
        let downstream = Port::of::<In2, CIn2>();
        if upstream != downstream {
            debug!(%upstream, %downstream, "rejecting flow composition");
            return Err(Error::CompositionType { upstream, downstream });
        }
        let mut links = self.links;
        links.extend(next.links);
        Ok(FlowWithContext::from_links(links))
    }

    fn then_carrying<Out2>(self, stage: Stage<Out, Out2>) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
    {
        let next = FlowWithContext::from_propagator(ContextPropagator::pass_through(&stage));
        self.via(next)
    }

    /// Transform each element; contexts pass through unchanged.
    pub fn map<Out2, F>(self, f: F) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> Out2 + Send + Sync + 'static,
    {
        self.then_carrying(Stage::map("map", f))
    }

    /// Transform each element with a fallible function.
    ///
    /// A failure surfaces as [`Error::Transformation`] carrying the element's context.
    pub fn try_map<Out2, F>(self, f: F) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> Result<Out2> + Send + Sync + 'static,
    {
        self.then_carrying(Stage::try_map("try_map", f))
    }

    /// Keep elements matching `predicate`; dropped elements take their context with them.
    pub fn filter<P>(self, predicate: P) -> FlowWithContext<In, CIn, Out, COut>
    where
        P: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        self.then_carrying(Stage::filter("filter", predicate))
    }

    /// Drop elements matching `predicate`.
    pub fn filter_not<P>(self, predicate: P) -> FlowWithContext<In, CIn, Out, COut>
    where
        P: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        self.then_carrying(Stage::filter("filter_not", move |out: &Out| !predicate(out)))
    }

    /// Map and filter in one pass, keeping `Some` results.
    pub fn filter_map<Out2, F>(self, f: F) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> Option<Out2> + Send + Sync + 'static,
    {
        self.then_carrying(Stage::filter_map("filter_map", f))
    }

    /// Transform each element asynchronously, keeping at most `parallelism` calls in flight.
    ///
    /// Outputs are emitted in input order regardless of completion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `parallelism` is zero.
    pub fn map_async<Out2, F, Fut>(self, parallelism: usize, f: F) -> Result<FlowWithContext<In, CIn, Out2, COut>>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out2>> + Send + 'static,
    {
        let stage = Stage::map_async("map_async", parallelism, f)?;
        Ok(self.then_carrying(stage))
    }

    /// Like [`FlowWithContext::map_async`], driven by a [`Transform`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `parallelism` is zero.
    pub fn map_async_with<T>(self, parallelism: usize, transform: T) -> Result<FlowWithContext<In, CIn, T::Output, COut>>
    where
        T: Transform<Input = Out> + 'static,
        T::Output: Send + 'static,
    {
        let stage = Stage::from_transform(parallelism, transform)?;
        Ok(self.then_carrying(stage))
    }

    /// Emit the running accumulator after every element. The seed is not emitted.
    ///
    /// The accumulator is private to each materialization.
    pub fn scan<Acc, F>(self, initial: Acc, f: F) -> FlowWithContext<In, CIn, Acc, COut>
    where
        Acc: Clone + Send + Sync + 'static,
        F: Fn(Acc, Out) -> Acc + Send + Sync + 'static,
    {
        self.then_carrying(Stage::scan("scan", initial, f))
    }

    /// Transform elements with a stateful mapper built by `factory` for each materialization.
    pub fn stateful_map<Out2, Factory, Mapper>(self, factory: Factory) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
        Factory: Fn() -> Mapper + Send + Sync + 'static,
        Mapper: FnMut(Out) -> Result<Out2> + Send + 'static,
    {
        self.then_carrying(Stage::stateful("stateful_map", factory))
    }

    /// Run a side effect on each element, passing it on unchanged.
    pub fn tap<F>(self, f: F) -> FlowWithContext<In, CIn, Out, COut>
    where
        F: Fn(&Out) + Send + Sync + 'static,
    {
        self.then_carrying(Stage::map("tap", move |out: Out| {
            f(&out);
            out
        }))
    }

    /// Emit a `tracing` debug event for each element.
    pub fn log(self, name: impl Into<String>) -> FlowWithContext<In, CIn, Out, COut>
    where
        Out: fmt::Debug,
    {
        let name = name.into();
        let label = name.clone();
        self.then_carrying(Stage::map(name, move |out: Out| {
            debug!(stage = %label, element = ?out, "element");
            out
        }))
    }

    /// Rewrite each context; elements pass through unchanged.
    pub fn map_context<COut2, F>(self, f: F) -> FlowWithContext<In, CIn, Out, COut2>
    where
        COut2: Send + 'static,
        F: Fn(COut) -> COut2 + Send + Sync + 'static,
    {
        self.via(FlowWithContext::from_propagator(ContextPropagator::remapping("map_context", f)))
    }

    /// Group elements into batches of `size`, with their contexts grouped in the same order.
    ///
    /// A final short batch is emitted when upstream completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `size` is zero.
    pub fn grouped(self, size: usize) -> Result<FlowWithContext<In, CIn, Vec<Out>, Vec<COut>>> {
        let propagator = ContextPropagator::batching("grouped", size)?;
        Ok(self.via(FlowWithContext::from_propagator(propagator)))
    }

    /// Spawn fresh propagators for one materialization.
    pub fn chain(&self) -> StageChain {
        instantiate(self.signature(), &self.links)
    }

    /// Forget the static types, keeping them as a runtime [`Signature`].
    pub fn into_untyped(self) -> UntypedFlow {
        UntypedFlow::from_parts(self.signature(), self.links)
    }

    /// Run the flow over `source` on `engine`.
    ///
    /// Every call spawns fresh propagator state, so one flow can be
    /// materialized any number of times, concurrently.
    pub fn materialize<E, S>(&self, engine: &E, source: S) -> PipelineHandle<Out, COut>
    where
        E: ExecutionEngine + ?Sized,
        S: Stream<Item = crate::PairedElement<In, CIn>> + Send + 'static,
    {
        let chain = self.chain();
        PipelineHandle::new(engine.materialize(chain, source.map(erase).boxed()))
    }
}

impl<In, CIn, Out, COut> FlowWithContext<In, CIn, Out, COut>
where
    In: Send + 'static,
    CIn: Send + 'static,
    Out: Send + 'static,
    COut: Clone + Send + 'static,
{
    /// Expand each element into any number of elements, all sharing its context.
    pub fn flat_map<Out2, F, I>(self, f: F) -> FlowWithContext<In, CIn, Out2, COut>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Out2>,
    {
        let stage = Stage::flat_map("flat_map", f);
        self.via(FlowWithContext::from_propagator(ContextPropagator::replicate(&stage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NotUsed, PairedElement, PropagationRule, StageKind, StreamEngine};
    use futures::stream;

    fn pairs<E, C>(items: Vec<(E, C)>) -> Vec<PairedElement<E, C>> {
        items.into_iter().map(PairedElement::from).collect()
    }

    async fn run<In, CIn, Out, COut>(
        flow: &FlowWithContext<In, CIn, Out, COut>,
        input: Vec<PairedElement<In, CIn>>,
    ) -> Result<Vec<PairedElement<Out, COut>>>
    where
        In: Send + 'static,
        CIn: Send + 'static,
        Out: Send + 'static,
        COut: Send + 'static,
    {
        flow.materialize(&StreamEngine::default(), stream::iter(input))
            .collect_pairs()
            .await
    }

    #[tokio::test]
    async fn test_composing_flows() {
        let flow1: FlowWithContext<i32, NotUsed, i32, NotUsed> = FlowWithContext::create();
        let flow2: FlowWithContext<i32, NotUsed, String, NotUsed> =
            FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x: i32| x.to_string());
        let flow3: FlowWithContext<i32, NotUsed, String, NotUsed> = flow1.via(flow2);

        assert_eq!(flow3.signature(), Signature::of::<i32, NotUsed, String, NotUsed>());
        let out = run(&flow3, pairs(vec![(1, NotUsed), (2, NotUsed)])).await.unwrap();
        assert_eq!(out, pairs(vec![("1".to_string(), NotUsed), ("2".to_string(), NotUsed)]));
    }

    #[tokio::test]
    async fn test_map_preserves_context() {
        let flow = FlowWithContext::<i32, u64, i32, u64>::create().map(|x| x * 10);
        let out = run(&flow, pairs(vec![(1, 100), (2, 200), (3, 300)])).await.unwrap();
        assert_eq!(out, pairs(vec![(10, 100), (20, 200), (30, 300)]));
    }

    #[tokio::test]
    async fn test_filter_keeps_original_contexts() {
        let flow = FlowWithContext::<i32, &str, i32, &str>::create().filter(|x| x % 2 == 0);
        let out = run(&flow, pairs(vec![(1, "a"), (2, "b"), (3, "c"), (4, "d")])).await.unwrap();
        assert_eq!(out, pairs(vec![(2, "b"), (4, "d")]));

        let flow = FlowWithContext::<i32, &str, i32, &str>::create().filter_not(|x| x % 2 == 0);
        let out = run(&flow, pairs(vec![(1, "a"), (2, "b")])).await.unwrap();
        assert_eq!(out, pairs(vec![(1, "a")]));
    }

    #[tokio::test]
    async fn test_via_matches_sequential_application() {
        let a = FlowWithContext::<i32, u8, i32, u8>::create().map(|x| x + 1);
        let b = FlowWithContext::<i32, u8, i32, u8>::create().filter(|x| *x > 2).map(|x| x * 2);
        let input = pairs(vec![(1, 1), (2, 2), (3, 3)]);

        let composed = run(&a.clone().via(b.clone()), input.clone()).await.unwrap();
        let first = run(&a, input).await.unwrap();
        let sequential = run(&b, first).await.unwrap();
        assert_eq!(composed, sequential);
        assert_eq!(composed, pairs(vec![(6, 2), (8, 3)]));
    }

    #[tokio::test]
    async fn test_via_is_associative() {
        let a = FlowWithContext::<i32, char, i32, char>::create().map(|x| x + 1);
        let b = FlowWithContext::<i32, char, i32, char>::create().flat_map(|x| vec![x, -x]);
        let c = FlowWithContext::<i32, char, i32, char>::create().map(|x| x.to_string());

        let left = a.clone().via(b.clone()).via(c.clone());
        let right = a.via(b.via(c));
        assert_eq!(left.stages(), right.stages());
        assert_eq!(left.signature(), right.signature());

        let input = pairs(vec![(1, 'x'), (5, 'y')]);
        assert_eq!(run(&left, input.clone()).await.unwrap(), run(&right, input).await.unwrap());
    }

    #[test]
    fn test_try_via_rejects_mismatched_types() {
        let strings = FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x| x.to_string());
        let wants_ints = FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x| x + 1);
        let err = strings.try_via(wants_ints).unwrap_err();
        match err {
            Error::CompositionType { upstream, downstream } => {
                assert_eq!(upstream, Port::of::<String, NotUsed>());
                assert_eq!(downstream, Port::of::<i32, NotUsed>());
            }
            other => panic!("expected CompositionType, got {other:?}"),
        }
    }

    #[test]
    fn test_try_via_rejects_mismatched_context() {
        let a = FlowWithContext::<i32, u8, i32, u8>::create();
        let b = FlowWithContext::<i32, u16, i32, u16>::create();
        assert!(matches!(a.try_via(b), Err(Error::CompositionType { .. })));
    }

    #[test]
    fn test_try_via_accepts_matching_types() {
        let a = FlowWithContext::<i32, u8, i32, u8>::create().map(|x| x.to_string());
        let b = FlowWithContext::<String, u8, String, u8>::create().map(|s| s.len());
        let composed = a.try_via(b).unwrap();
        assert_eq!(composed.signature(), Signature::of::<i32, u8, usize, u8>());
        assert_eq!(composed.len(), 2);
    }

    #[test]
    fn test_composition_leaves_inputs_untouched() {
        let base = FlowWithContext::<i32, (), i32, ()>::create().map(|x| x + 1);
        let extended = base.clone().filter(|x| *x > 0);
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.stages()[1].kind, StageKind::Filter);
    }

    #[tokio::test]
    async fn test_flat_map_replicates_context() {
        let flow = FlowWithContext::<i32, &str, i32, &str>::create().flat_map(|x| vec![x, x + 1]);
        assert_eq!(flow.stages()[0].rule, PropagationRule::Replicate);
        let out = run(&flow, pairs(vec![(10, "c")])).await.unwrap();
        assert_eq!(out, pairs(vec![(10, "c"), (11, "c")]));
    }

    #[tokio::test]
    async fn test_grouped_collects_contexts() {
        let flow = FlowWithContext::<i32, u32, i32, u32>::create().grouped(2).unwrap();
        let out = run(&flow, pairs(vec![(1, 10), (2, 20), (3, 30)])).await.unwrap();
        assert_eq!(out, pairs(vec![(vec![1, 2], vec![10, 20]), (vec![3], vec![30])]));
    }

    #[test]
    fn test_grouped_rejects_zero() {
        let err = FlowWithContext::<i32, u32, i32, u32>::create().grouped(0).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_scan_state_is_fresh_per_materialization() {
        let flow = FlowWithContext::<i32, u8, i32, u8>::create().scan(0, |acc, x| acc + x);
        let input = pairs(vec![(1, 1), (2, 2), (3, 3)]);
        let expected = pairs(vec![(1, 1), (3, 2), (6, 3)]);
        assert_eq!(run(&flow, input.clone()).await.unwrap(), expected);
        assert_eq!(run(&flow, input).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_map_context_and_filter_map() {
        let flow = FlowWithContext::<&str, u64, &str, u64>::create()
            .filter_map(|s| s.parse::<i32>().ok())
            .map_context(|offset| format!("offset-{offset}"));
        let out = run(&flow, pairs(vec![("1", 1), ("x", 2), ("3", 3)])).await.unwrap();
        assert_eq!(out, pairs(vec![(1, "offset-1".to_string()), (3, "offset-3".to_string())]));
    }

    #[tokio::test]
    async fn test_try_map_failure_carries_context() {
        let flow = FlowWithContext::<&str, u64, &str, u64>::create()
            .try_map(|s| s.parse::<i32>().map_err(|e| Error::Execution(e.to_string())));
        let err = run(&flow, pairs(vec![("1", 1), ("oops", 2)])).await.unwrap_err();
        let failure = err.as_transformation().unwrap();
        assert_eq!(failure.stage(), "try_map");
        assert_eq!(failure.context::<u64>(), Some(&2));
    }

    #[tokio::test]
    async fn test_map_async_with_transform() {
        use crate::LambdaTransform;

        let lookup = LambdaTransform::new(|id: u32| async move { Ok::<String, Error>(format!("user-{id}")) })
            .with_name("lookup");
        let flow = FlowWithContext::<u32, u64, u32, u64>::create().map_async_with(2, lookup).unwrap();
        assert_eq!(flow.stages()[0].name, "lookup");
        assert_eq!(flow.stages()[0].kind, StageKind::MapAsync);

        let out = run(&flow, pairs(vec![(7, 70), (8, 80)])).await.unwrap();
        assert_eq!(out, pairs(vec![("user-7".to_string(), 70), ("user-8".to_string(), 80)]));
        assert!(FlowWithContext::<u32, u64, u32, u64>::create()
            .map_async(0, |x| async move { Ok::<u32, Error>(x) })
            .is_err());
    }

    #[tokio::test]
    async fn test_contexts_need_not_be_sync() {
        use std::cell::Cell;

        let flow = FlowWithContext::<i32, Cell<u64>, i32, Cell<u64>>::create()
            .map_async(2, |x| async move { Ok::<i32, Error>(x * 10) })
            .unwrap()
            .grouped(2)
            .unwrap()
            .map_context(|acks: Vec<Cell<u64>>| acks.iter().map(Cell::get).sum::<u64>());
        let input = vec![PairedElement::new(1, Cell::new(1)), PairedElement::new(2, Cell::new(2))];
        let out = run(&flow, input).await.unwrap();
        assert_eq!(out, vec![PairedElement::new(vec![10, 20], 3)]);
    }

    #[tokio::test]
    async fn test_stateful_map_and_tap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let flow = FlowWithContext::<char, u8, char, u8>::create()
            .tap(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .stateful_map(|| {
                let mut index = 0usize;
                move |c: char| {
                    index += 1;
                    Ok::<String, Error>(format!("{index}:{c}"))
                }
            })
            .log("indexed");
        let out = run(&flow, pairs(vec![('a', 1), ('b', 2)])).await.unwrap();
        assert_eq!(out, pairs(vec![("1:a".to_string(), 1), ("2:b".to_string(), 2)]));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
