//! Context propagation around context-unaware stages.
//!
//! A [`ContextPropagator`] wraps exactly one [`Stage`]. It splits each
//! incoming [`PairedElement`], feeds the value to the stage, and pairs every
//! output with a context according to a rule chosen from the stage's
//! declared [`Multiplicity`]:
//!
//! | Stage kind | Rule |
//! |---|---|
//! | map, filter, stateful scan, map async | [`PropagationRule::PassThrough`] |
//! | flat map | [`PropagationRule::Replicate`] |
//! | batch | [`PropagationRule::Collect`] |
//! | `map_context` | [`PropagationRule::Remap`] |
//!
//! For every input, the number of contexts emitted equals the number of
//! elements emitted. Async stages capture the context before suspending and
//! release their results through a [`ReorderBuffer`], so outputs leave in
//! input order even when calls complete out of order.

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::stage::{Multiplicity, RunningStage, Stage, StageKind};
use crate::{Error, PairedElement, Result, TransformationError};

pub mod erased;
pub mod reorder;

pub use reorder::ReorderBuffer;

/// How a propagator maps input contexts onto output contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationRule {
    /// The input context moves onto the single output, or is dropped with the element.
    PassThrough,
    /// Every output of one input receives a copy of its context.
    Replicate,
    /// The contexts of all inputs in a batch become one ordered `Vec`.
    Collect,
    /// The context is rewritten by a context-aware function; the element is untouched.
    Remap,
}

/// Structural description of one propagator in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// The stage name.
    pub name: String,
    /// The stage's operator kind.
    pub kind: StageKind,
    /// The declared output multiplicity.
    pub multiplicity: Multiplicity,
    /// The context rule in force.
    pub rule: PropagationRule,
}

enum Rule<CIn, COut> {
    Carry(fn(CIn) -> COut),
    Replicate(fn(&CIn) -> COut),
    Collect(fn(Vec<CIn>) -> COut),
    Remap(Arc<dyn Fn(CIn) -> COut + Send + Sync>),
}

impl<CIn, COut> Rule<CIn, COut> {
    fn fresh(&self) -> Self {
        match self {
            Rule::Carry(carry) => Rule::Carry(*carry),
            Rule::Replicate(replicate) => Rule::Replicate(*replicate),
            Rule::Collect(assemble) => Rule::Collect(*assemble),
            Rule::Remap(f) => Rule::Remap(Arc::clone(f)),
        }
    }

    fn describe(&self) -> PropagationRule {
        match self {
            Rule::Carry(_) => PropagationRule::PassThrough,
            Rule::Replicate(_) => PropagationRule::Replicate,
            Rule::Collect(_) => PropagationRule::Collect,
            Rule::Remap(_) => PropagationRule::Remap,
        }
    }
}

/// The outcome of one async propagation, tagged with its dispatch sequence number.
///
/// Hand it back to [`ContextPropagator::accept`]; results are then released
/// in dispatch order by [`ContextPropagator::next_ready`].
pub struct Completion<Out, COut> {
    seq: u64,
    result: Result<Vec<PairedElement<Out, COut>>>,
}

impl<Out, COut> Completion<Out, COut> {
    /// The dispatch sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether the call failed.
    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }
}

/// A [`Stage`] lifted to operate on [`PairedElement`]s.
///
/// # Example
///
/// ```rust
/// use context_flow::{ContextPropagator, PairedElement, Stage};
///
/// let mut propagator = ContextPropagator::carrying(Stage::map("inc", |x: i32| x + 1)).unwrap();
/// let out = propagator.propagate(PairedElement::new(1, "offset-9")).unwrap();
/// assert_eq!(out, vec![PairedElement::new(2, "offset-9")]);
/// ```
pub struct ContextPropagator<In, CIn, Out, COut> {
    running: RunningStage<In, Out>,
    rule: Rule<CIn, COut>,
    pending: Vec<CIn>,
    reorder: ReorderBuffer<Result<Vec<PairedElement<Out, COut>>>>,
}

impl<In, C, Out> ContextPropagator<In, C, Out, C>
where
    In: Send + 'static,
    Out: Send + 'static,
    C: Send + 'static,
{
    /// Wrap a stage producing at most one output per input, passing contexts through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for flat map and batch stages, whose
    /// outputs cannot each take over the input context.
    pub fn carrying(stage: Stage<In, Out>) -> Result<Self> {
        if stage.kind() == StageKind::Batch || stage.multiplicity().upper_bound() != Some(1) {
            return Err(Error::Validation(format!(
                "{} stage '{}' cannot pass a single context through",
                stage.kind(),
                stage.name()
            )));
        }
        Ok(Self::pass_through(&stage))
    }

    pub(crate) fn pass_through(stage: &Stage<In, Out>) -> Self {
        Self::from_parts(stage, Rule::Carry(|ctx| ctx))
    }
}

impl<In, C, Out> ContextPropagator<In, C, Out, C>
where
    In: Send + 'static,
    Out: Send + 'static,
    C: Clone + Send + 'static,
{
    /// Wrap a synchronous stage, copying the input context onto every output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for async and batch stages.
    pub fn replicating(stage: Stage<In, Out>) -> Result<Self> {
        if matches!(stage.kind(), StageKind::MapAsync | StageKind::Batch) {
            return Err(Error::Validation(format!(
                "{} stage '{}' cannot replicate contexts",
                stage.kind(),
                stage.name()
            )));
        }
        Ok(Self::replicate(&stage))
    }

    pub(crate) fn replicate(stage: &Stage<In, Out>) -> Self {
        Self::from_parts(stage, Rule::Replicate(C::clone))
    }
}

impl<T, C> ContextPropagator<T, C, Vec<T>, Vec<C>>
where
    T: Send + 'static,
    C: Send + 'static,
{
    /// Collect `size` elements into a `Vec`, and their contexts into a parallel `Vec`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `size` is zero.
    pub fn batching(name: impl Into<String>, size: usize) -> Result<Self> {
        let stage = Stage::batch(name, size)?;
        Ok(Self::from_parts(&stage, Rule::Collect(|contexts| contexts)))
    }
}

impl<T, CIn, COut> ContextPropagator<T, CIn, T, COut>
where
    T: Send + 'static,
    CIn: Send + 'static,
    COut: Send + 'static,
{
    /// Rewrite every context with `f`, leaving elements untouched.
    pub fn remapping<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CIn) -> COut + Send + Sync + 'static,
    {
        Self::from_parts(&Stage::identity(name), Rule::Remap(Arc::new(f)))
    }
}

/// An immutable recipe for propagators with fresh state.
///
/// Shared by every materialization of a flow; each one spawns its own
/// [`ContextPropagator`] from it.
pub(crate) struct PropagatorTemplate<In, CIn, Out, COut> {
    stage: Stage<In, Out>,
    rule: Rule<CIn, COut>,
}

impl<In, CIn, Out, COut> PropagatorTemplate<In, CIn, Out, COut>
where
    In: Send + 'static,
    Out: Send + 'static,
    CIn: Send + 'static,
    COut: Send + 'static,
{
    pub(crate) fn spawn(&self) -> ContextPropagator<In, CIn, Out, COut> {
        ContextPropagator::from_parts(&self.stage, self.rule.fresh())
    }
}

impl<In, CIn, Out, COut> ContextPropagator<In, CIn, Out, COut>
where
    In: Send + 'static,
    Out: Send + 'static,
    CIn: Send + 'static,
    COut: Send + 'static,
{
    fn from_parts(stage: &Stage<In, Out>, rule: Rule<CIn, COut>) -> Self {
        Self {
            running: stage.start(),
            rule,
            pending: Vec::new(),
            reorder: ReorderBuffer::new(),
        }
    }

    /// A copy of this propagator with fresh running state.
    ///
    /// Batch buffers, scan accumulators and in-flight async calls are not
    /// carried over.
    #[must_use]
    pub fn fresh(&self) -> Self {
        self.template().spawn()
    }

    pub(crate) fn template(&self) -> PropagatorTemplate<In, CIn, Out, COut> {
        PropagatorTemplate {
            stage: self.running.stage().clone(),
            rule: self.rule.fresh(),
        }
    }

    /// The wrapped stage.
    pub fn stage(&self) -> &Stage<In, Out> {
        self.running.stage()
    }

    /// The stage name.
    pub fn name(&self) -> &str {
        self.running.stage().name()
    }

    /// The context rule in force.
    pub fn rule(&self) -> PropagationRule {
        self.rule.describe()
    }

    /// Structural description of this propagator.
    pub fn descriptor(&self) -> StageDescriptor {
        let stage = self.running.stage();
        StageDescriptor {
            name: stage.name().to_string(),
            kind: stage.kind(),
            multiplicity: stage.multiplicity(),
            rule: self.rule(),
        }
    }

    /// Whether inputs must go through [`ContextPropagator::propagate_async`].
    pub fn is_async(&self) -> bool {
        self.running.stage().is_async()
    }

    /// Maximum number of async calls the engine may keep in flight.
    pub fn parallelism(&self) -> usize {
        self.running.stage().parallelism()
    }

    /// Async calls dispatched but not yet released.
    pub fn in_flight(&self) -> usize {
        self.reorder.in_flight()
    }

    /// Run one pair through a synchronous stage.
    ///
    /// # Errors
    ///
    /// A stage failure is returned as [`Error::Transformation`] carrying the
    /// input's context; anything the propagator had buffered is discarded.
    /// Async stages return [`Error::Validation`].
    pub fn propagate(&mut self, input: PairedElement<In, CIn>) -> Result<Vec<PairedElement<Out, COut>>> {
        if self.is_async() {
            return Err(Error::Validation(format!(
                "async stage '{}' must be driven through propagate_async",
                self.name()
            )));
        }
        let (value, context) = input.into_parts();
        match self.running.push(value) {
            Ok(outputs) => self.attach(outputs, context),
            Err(source) => Err(self.fail(context, source)),
        }
    }

    /// Emit whatever the stage still buffers once upstream has completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if buffered contexts and
    /// buffered elements disagree.
    pub fn flush(&mut self) -> Result<Vec<PairedElement<Out, COut>>> {
        let buffered = self.running.buffered();
        let outputs = self.running.finish();
        let name = self.running.stage().name();
        match &self.rule {
            Rule::Collect(assemble) => {
                let pending = &mut self.pending;
                if pending.len() != buffered {
                    return Err(Error::invariant(
                        name,
                        format!("{} buffered contexts for {buffered} buffered elements", pending.len()),
                    ));
                }
                let contexts = std::mem::take(pending);
                match outputs.len() {
                    0 if contexts.is_empty() => Ok(Vec::new()),
                    1 => Ok(outputs
                        .into_iter()
                        .next()
                        .map(|out| PairedElement::new(out, assemble(contexts)))
                        .into_iter()
                        .collect()),
                    n => Err(Error::invariant(name, format!("flush produced {n} batches"))),
                }
            }
            _ if outputs.is_empty() => Ok(Vec::new()),
            _ => Err(Error::invariant(name, "flush produced elements without contexts")),
        }
    }

    /// Start one pair through the stage, returning a future for its completion.
    ///
    /// The context is captured now and attached only when the stage's
    /// future resolves. Synchronous stages complete immediately.
    pub fn propagate_async(&mut self, input: PairedElement<In, CIn>) -> BoxFuture<'static, Completion<Out, COut>> {
        if !self.is_async() {
            // A failing propagate clears the reorder buffer, so reserve the slot afterwards.
            let result = self.propagate(input);
            let seq = self.reorder.dispatch();
            return future::ready(Completion { seq, result }).boxed();
        }

        let seq = self.reorder.dispatch();
        let (value, context) = input.into_parts();
        let name = self.name().to_string();
        let carry = match &self.rule {
            Rule::Carry(carry) => Some(*carry),
            _ => None,
        };
        trace!(stage = %name, seq, "dispatching async call");
        let pending = self.running.stage().apply_async(value);
        async move {
            let result = match (pending.await, carry) {
                (Ok(mut outputs), Some(carry)) if outputs.len() == 1 => {
                    let out = outputs.remove(0);
                    Ok(vec![PairedElement::new(out, carry(context))])
                }
                (Ok(outputs), Some(_)) => Err(Error::invariant(
                    &name,
                    format!("async call produced {} outputs", outputs.len()),
                )),
                (Ok(_), None) => Err(Error::invariant(&name, "async stage without a pass-through rule")),
                (Err(source), _) => {
                    warn!(stage = %name, seq, error = %source, "async stage failed");
                    Err(TransformationError::new(name, context, source).into())
                }
            };
            Completion { seq, result }
        }
        .boxed()
    }

    /// Record a completion returned by a future from [`ContextPropagator::propagate_async`].
    ///
    /// Returns `false` if the completion belongs to cancelled work and was dropped.
    pub fn accept(&mut self, completion: Completion<Out, COut>) -> bool {
        let seq = completion.seq;
        let accepted = self.reorder.complete(seq, completion.result);
        if !accepted {
            trace!(stage = %self.name(), seq, "dropping completion for cancelled work");
        }
        accepted
    }

    /// Release the next result in input order, if it has completed.
    ///
    /// After a failure is released, every later result is discarded.
    pub fn next_ready(&mut self) -> Option<Result<Vec<PairedElement<Out, COut>>>> {
        let result = self.reorder.pop_ready()?;
        if result.is_err() {
            self.reorder.clear();
        }
        Some(result)
    }

    /// Abandon everything in flight or buffered. Later completions are ignored.
    pub fn cancel(&mut self) {
        if self.reorder.in_flight() > 0 || self.running.buffered() > 0 {
            debug!(
                stage = %self.name(),
                in_flight = self.reorder.in_flight(),
                buffered = self.running.buffered(),
                "cancelling propagator"
            );
        }
        self.reorder.clear();
        self.running.discard();
        self.pending.clear();
    }

    fn fail(&mut self, context: CIn, source: Error) -> Error {
        warn!(stage = %self.name(), error = %source, "stage failed");
        self.cancel();
        TransformationError::new(self.name(), context, source).into()
    }

    fn attach(&mut self, outputs: Vec<Out>, context: CIn) -> Result<Vec<PairedElement<Out, COut>>> {
        let stage = self.running.stage();
        let multiplicity = stage.multiplicity();
        if !multiplicity.admits(outputs.len()) {
            return Err(Error::invariant(
                stage.name(),
                format!("produced {} outputs but declared {multiplicity:?}", outputs.len()),
            ));
        }
        match &self.rule {
            Rule::Carry(carry) => Ok(outputs
                .into_iter()
                .next()
                .map(|out| PairedElement::new(out, carry(context)))
                .into_iter()
                .collect()),
            Rule::Remap(f) => Ok(outputs
                .into_iter()
                .next()
                .map(|out| PairedElement::new(out, f(context)))
                .into_iter()
                .collect()),
            Rule::Replicate(replicate) => Ok(outputs
                .into_iter()
                .map(|out| PairedElement::new(out, replicate(&context)))
                .collect()),
            Rule::Collect(assemble) => {
                let pending = &mut self.pending;
                pending.push(context);
                let Some(batch) = outputs.into_iter().next() else {
                    return Ok(Vec::new());
                };
                if let Multiplicity::Batched(size) = multiplicity {
                    if pending.len() != size {
                        return Err(Error::invariant(
                            stage.name(),
                            format!("batch of {size} emitted with {} contexts", pending.len()),
                        ));
                    }
                }
                let contexts = std::mem::take(pending);
                Ok(vec![PairedElement::new(batch, assemble(contexts))])
            }
        }
    }
}

impl<In, CIn, Out, COut> fmt::Debug for ContextPropagator<In, CIn, Out, COut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPropagator")
            .field("stage", self.running.stage())
            .field("rule", &self.rule.describe())
            .field("in_flight", &self.reorder.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{FuturesUnordered, StreamExt};
    use std::time::Duration;

    fn pair<E, C>(value: E, context: C) -> PairedElement<E, C> {
        PairedElement::new(value, context)
    }

    #[test]
    fn test_map_passes_context_through() {
        let mut p = ContextPropagator::carrying(Stage::map("str", |x: i32| x.to_string())).unwrap();
        assert_eq!(p.rule(), PropagationRule::PassThrough);
        assert_eq!(p.propagate(pair(7, 'a')).unwrap(), vec![pair("7".to_string(), 'a')]);
    }

    #[test]
    fn test_filter_drops_context_with_element() {
        let mut p = ContextPropagator::carrying(Stage::filter("odd", |x: &i32| x % 2 == 1)).unwrap();
        assert_eq!(p.propagate(pair(1, 10u8)).unwrap(), vec![pair(1, 10u8)]);
        assert!(p.propagate(pair(2, 20u8)).unwrap().is_empty());
        assert_eq!(p.propagate(pair(3, 30u8)).unwrap(), vec![pair(3, 30u8)]);
    }

    #[test]
    fn test_flat_map_replicates_context() {
        let stage = Stage::flat_map("spread", |x: i32| vec![x, x + 1]);
        let mut p = ContextPropagator::replicating(stage).unwrap();
        assert_eq!(p.propagate(pair(5, "c")).unwrap(), vec![pair(5, "c"), pair(6, "c")]);
    }

    #[test]
    fn test_flat_map_cannot_carry() {
        let stage = Stage::flat_map("spread", |x: i32| vec![x, x]);
        let err = ContextPropagator::<i32, u8, i32, u8>::carrying(stage).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_batch_collects_contexts_in_order() {
        let mut p = ContextPropagator::<i32, &str, Vec<i32>, Vec<&str>>::batching("pairs", 2).unwrap();
        assert_eq!(p.rule(), PropagationRule::Collect);
        assert!(p.propagate(pair(1, "a")).unwrap().is_empty());
        assert_eq!(p.propagate(pair(2, "b")).unwrap(), vec![pair(vec![1, 2], vec!["a", "b"])]);
        assert!(p.propagate(pair(3, "c")).unwrap().is_empty());
        assert_eq!(p.flush().unwrap(), vec![pair(vec![3], vec!["c"])]);
        assert!(p.flush().unwrap().is_empty());
    }

    #[test]
    fn test_scan_keeps_state_out_of_context() {
        let stage = Stage::scan("sum", 0, |acc: i32, x: i32| acc + x);
        let mut p = ContextPropagator::carrying(stage).unwrap();
        assert_eq!(p.propagate(pair(1, 100u32)).unwrap(), vec![pair(1, 100u32)]);
        assert_eq!(p.propagate(pair(2, 200u32)).unwrap(), vec![pair(3, 200u32)]);

        let mut fresh = p.fresh();
        assert_eq!(fresh.propagate(pair(5, 1u32)).unwrap(), vec![pair(5, 1u32)]);
    }

    #[test]
    fn test_remap_rewrites_context_only() {
        let mut p = ContextPropagator::remapping("ctx", |offset: u64| format!("offset-{offset}"));
        assert_eq!(p.rule(), PropagationRule::Remap);
        assert_eq!(p.propagate(pair('x', 4u64)).unwrap(), vec![pair('x', "offset-4".to_string())]);
    }

    #[test]
    fn test_failure_carries_context() {
        let stage = Stage::try_map("parse", |s: String| {
            s.parse::<i32>().map_err(|e| Error::Execution(e.to_string()))
        });
        let mut p = ContextPropagator::carrying(stage).unwrap();
        let err = p.propagate(pair("nope".to_string(), 42u64)).unwrap_err();
        let failure = err.as_transformation().unwrap();
        assert_eq!(failure.stage(), "parse");
        assert_eq!(failure.context::<u64>(), Some(&42));
        assert!(matches!(failure.cause(), Error::Execution(_)));
    }

    #[test]
    fn test_async_stage_rejects_sync_propagate() {
        let stage = Stage::map_async("slow", 1, |x: i32| async move { Ok::<i32, Error>(x) }).unwrap();
        let mut p = ContextPropagator::carrying(stage).unwrap();
        assert!(matches!(p.propagate(pair(1, ())), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_async_releases_in_input_order() {
        let stage = Stage::map_async("delay", 3, |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, Error>(ms * 10)
        })
        .unwrap();
        let mut p = ContextPropagator::carrying(stage).unwrap();

        let mut in_flight = FuturesUnordered::new();
        for (ms, ctx) in [(30, "c1"), (5, "c2"), (15, "c3")] {
            in_flight.push(p.propagate_async(pair(ms, ctx)));
        }
        assert_eq!(p.in_flight(), 3);

        let mut released = Vec::new();
        let mut completion_order = Vec::new();
        while let Some(completion) = in_flight.next().await {
            completion_order.push(completion.seq());
            assert!(p.accept(completion));
            while let Some(result) = p.next_ready() {
                released.extend(result.unwrap());
            }
        }
        assert_ne!(completion_order, vec![0, 1, 2]);
        assert_eq!(released, vec![pair(300, "c1"), pair(50, "c2"), pair(150, "c3")]);
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_async_failure_discards_later_results() {
        let stage = Stage::map_async("check", 2, |x: i32| async move {
            if x < 0 {
                Err(Error::from("negative"))
            } else {
                Ok(x)
            }
        })
        .unwrap();
        let mut p = ContextPropagator::carrying(stage).unwrap();
        let bad = p.propagate_async(pair(-1, "bad"));
        let good = p.propagate_async(pair(2, "good"));

        assert!(p.accept(good.await));
        assert!(p.next_ready().is_none());
        assert!(p.accept(bad.await));

        let err = p.next_ready().unwrap().unwrap_err();
        assert_eq!(err.as_transformation().unwrap().context::<&str>(), Some(&"bad"));
        assert!(p.next_ready().is_none());
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_ignores_late_completions() {
        let stage = Stage::map_async("id", 1, |x: i32| async move { Ok::<i32, Error>(x) }).unwrap();
        let mut p = ContextPropagator::carrying(stage).unwrap();
        let pending = p.propagate_async(pair(1, ()));
        p.cancel();
        assert!(!p.accept(pending.await));
        assert!(p.next_ready().is_none());
    }
}
