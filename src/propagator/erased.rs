//! Type-erased propagators, as handed to an execution engine.
//!
//! An engine drives heterogeneous chains: every propagator in a flow has its
//! own element and context types. At the engine boundary elements and
//! contexts travel boxed as [`AnyElement`] / [`AnyContext`], and each
//! propagator downcasts on the way in. Composition has already checked the
//! types, so a failed downcast is an [`Error::InvariantViolation`].

use futures::future::{BoxFuture, FutureExt};
use std::any::Any;

use super::{Completion, ContextPropagator, StageDescriptor};
use crate::flow::signature::Signature;
use crate::{Error, PairedElement, Result};

/// A boxed element.
pub type AnyElement = Box<dyn Any + Send>;
/// A boxed context.
pub type AnyContext = Box<dyn Any + Send>;
/// A boxed element/context pair.
pub type ErasedPair = PairedElement<AnyElement, AnyContext>;

/// An opaque async completion, to be returned to the propagator that produced it.
pub struct ErasedCompletion(Box<dyn Any + Send>);

/// Box both halves of a pair.
pub fn erase<E, C>(pair: PairedElement<E, C>) -> ErasedPair
where
    E: Send + 'static,
    C: Send + 'static,
{
    let (value, context) = pair.into_parts();
    PairedElement::new(Box::new(value) as AnyElement, Box::new(context) as AnyContext)
}

/// Unbox a pair, reporting a mismatch against `stage`.
///
/// # Errors
///
/// Returns [`Error::InvariantViolation`] if either half is not of the expected type.
pub fn restore<E, C>(pair: ErasedPair, stage: &str) -> Result<PairedElement<E, C>>
where
    E: 'static,
    C: 'static,
{
    let (value, context) = pair.into_parts();
    let value = value.downcast::<E>().map_err(|_| {
        Error::invariant(stage, format!("expected element of type {}", std::any::type_name::<E>()))
    })?;
    let context = context.downcast::<C>().map_err(|_| {
        Error::invariant(stage, format!("expected context of type {}", std::any::type_name::<C>()))
    })?;
    Ok(PairedElement::new(*value, *context))
}

/// The object-safe face of a [`ContextPropagator`].
pub trait ErasedPropagator: Send {
    /// Structural description.
    fn descriptor(&self) -> StageDescriptor;
    /// Declared input and output types.
    fn signature(&self) -> Signature;
    /// Whether inputs must go through [`ErasedPropagator::propagate_async`].
    fn is_async(&self) -> bool;
    /// Maximum number of async calls in flight.
    fn parallelism(&self) -> usize;
    /// Synchronous propagation.
    fn propagate(&mut self, input: ErasedPair) -> Result<Vec<ErasedPair>>;
    /// Emit buffered output once upstream has completed.
    fn flush(&mut self) -> Result<Vec<ErasedPair>>;
    /// Start an async propagation.
    fn propagate_async(&mut self, input: ErasedPair) -> BoxFuture<'static, ErasedCompletion>;
    /// Record a finished async propagation.
    fn accept(&mut self, completion: ErasedCompletion) -> Result<bool>;
    /// Release the next async result in input order.
    fn next_ready(&mut self) -> Option<Result<Vec<ErasedPair>>>;
    /// Async calls dispatched but not yet released.
    fn in_flight(&self) -> usize;
    /// Abandon in-flight and buffered work.
    fn cancel(&mut self);
}

fn erase_all<Out, COut>(pairs: Vec<PairedElement<Out, COut>>) -> Vec<ErasedPair>
where
    Out: Send + 'static,
    COut: Send + 'static,
{
    pairs.into_iter().map(erase).collect()
}

impl<In, CIn, Out, COut> ErasedPropagator for ContextPropagator<In, CIn, Out, COut>
where
    In: Send + 'static,
    Out: Send + 'static,
    CIn: Send + 'static,
    COut: Send + 'static,
{
    fn descriptor(&self) -> StageDescriptor {
        ContextPropagator::descriptor(self)
    }

    fn signature(&self) -> Signature {
        Signature::of::<In, CIn, Out, COut>()
    }

    fn is_async(&self) -> bool {
        ContextPropagator::is_async(self)
    }

    fn parallelism(&self) -> usize {
        ContextPropagator::parallelism(self)
    }

    fn propagate(&mut self, input: ErasedPair) -> Result<Vec<ErasedPair>> {
        let input = restore::<In, CIn>(input, self.name())?;
        ContextPropagator::propagate(self, input).map(erase_all)
    }

    fn flush(&mut self) -> Result<Vec<ErasedPair>> {
        ContextPropagator::flush(self).map(erase_all)
    }

    fn propagate_async(&mut self, input: ErasedPair) -> BoxFuture<'static, ErasedCompletion> {
        match restore::<In, CIn>(input, self.name()) {
            Ok(input) => ContextPropagator::propagate_async(self, input)
                .map(|completion| ErasedCompletion(Box::new(completion)))
                .boxed(),
            Err(err) => {
                // Keep the sequence numbering intact so the error is released in order.
                let seq = self.reorder.dispatch();
                let completion: Completion<Out, COut> = Completion { seq, result: Err(err) };
                futures::future::ready(ErasedCompletion(Box::new(completion))).boxed()
            }
        }
    }

    fn accept(&mut self, completion: ErasedCompletion) -> Result<bool> {
        let completion = completion
            .0
            .downcast::<Completion<Out, COut>>()
            .map_err(|_| Error::invariant(self.name(), "completion from a different propagator"))?;
        Ok(ContextPropagator::accept(self, *completion))
    }

    fn next_ready(&mut self) -> Option<Result<Vec<ErasedPair>>> {
        ContextPropagator::next_ready(self).map(|result| result.map(erase_all))
    }

    fn in_flight(&self) -> usize {
        ContextPropagator::in_flight(self)
    }

    fn cancel(&mut self) {
        ContextPropagator::cancel(self)
    }
}
