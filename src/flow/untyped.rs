//! Flows whose types are only known at runtime.

use std::fmt;
use tracing::debug;

use super::signature::{Port, Signature};
use super::{instantiate, FlowWithContext, Link};
use crate::engine::StageChain;
use crate::propagator::StageDescriptor;
use crate::{Error, Result};

/// A flow with its element and context types recorded as a [`Signature`]
/// instead of type parameters.
///
/// Useful when a pipeline is assembled from configuration or plugins. Every
/// composition is checked when it is built, never when elements flow.
///
/// # Example
///
/// ```rust
/// use context_flow::{Error, FlowWithContext, NotUsed};
///
/// let parse = FlowWithContext::<String, NotUsed, String, NotUsed>::create()
///     .map(|s| s.len())
///     .into_untyped();
/// let wrong = FlowWithContext::<String, NotUsed, String, NotUsed>::create().into_untyped();
///
/// let err = parse.via(wrong).unwrap_err();
/// assert!(matches!(err, Error::CompositionType { .. }));
/// ```
#[derive(Clone)]
pub struct UntypedFlow {
    signature: Signature,
    links: Vec<Link>,
}

impl UntypedFlow {
    pub(crate) fn from_parts(signature: Signature, links: Vec<Link>) -> Self {
        Self { signature, links }
    }

    /// The identity flow over `(T, C)` pairs.
    pub fn identity<T: 'static, C: 'static>() -> Self {
        Self::from_parts(Signature::identity::<T, C>(), Vec::new())
    }

    /// The declared input and output types.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// The propagators in execution order.
    pub fn stages(&self) -> Vec<StageDescriptor> {
        self.links.iter().map(|link| link.descriptor().clone()).collect()
    }

    /// Number of propagators.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether this is an identity flow.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Append `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompositionType`] if this flow's outlet is not `next`'s inlet.
    pub fn via(self, next: UntypedFlow) -> Result<UntypedFlow> {
        if !self.signature.feeds(&next.signature) {
            debug!(upstream = %self.signature.outlet, downstream = %next.signature.inlet, "rejecting flow composition");
            return Err(Error::CompositionType {
                upstream: self.signature.outlet,
                downstream: next.signature.inlet,
            });
        }
        let signature = self.signature.then(&next.signature);
        let mut links = self.links;
        links.extend(next.links);
        Ok(Self::from_parts(signature, links))
    }

    /// Recover the statically typed flow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompositionType`] if the requested types differ from
    /// the declared ones; the mismatching side is reported.
    pub fn into_typed<In, CIn, Out, COut>(self) -> Result<FlowWithContext<In, CIn, Out, COut>>
    where
        In: 'static,
        CIn: 'static,
        Out: 'static,
        COut: 'static,
    {
        let wanted = Signature::of::<In, CIn, Out, COut>();
        if wanted.inlet != self.signature.inlet {
            return Err(Error::CompositionType {
                upstream: wanted.inlet,
                downstream: self.signature.inlet,
            });
        }
        if wanted.outlet != self.signature.outlet {
            return Err(Error::CompositionType {
                upstream: self.signature.outlet,
                downstream: wanted.outlet,
            });
        }
        Ok(FlowWithContext::from_links(self.links))
    }

    /// Whether this flow consumes `(E, C)` pairs.
    pub fn accepts<E: 'static, C: 'static>(&self) -> bool {
        self.signature.inlet == Port::of::<E, C>()
    }

    /// Spawn fresh propagators for one materialization.
    pub fn chain(&self) -> StageChain {
        instantiate(self.signature, &self.links)
    }
}

impl fmt::Debug for UntypedFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UntypedFlow")
            .field("signature", &self.signature)
            .field("stages", &self.links)
            .finish()
    }
}

impl<In, CIn, Out, COut> From<FlowWithContext<In, CIn, Out, COut>> for UntypedFlow
where
    In: Send + 'static,
    CIn: Send + 'static,
    Out: Send + 'static,
    COut: Send + 'static,
{
    fn from(flow: FlowWithContext<In, CIn, Out, COut>) -> Self {
        flow.into_untyped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NotUsed, PairedElement, StreamEngine};
    use futures::stream;

    #[test]
    fn test_via_checks_ports() {
        let to_string = FlowWithContext::<i32, u8, i32, u8>::create().map(|x| x.to_string()).into_untyped();
        let len = FlowWithContext::<String, u8, String, u8>::create().map(|s| s.len()).into_untyped();

        let composed = to_string.clone().via(len).unwrap();
        assert_eq!(composed.signature(), Signature::of::<i32, u8, usize, u8>());
        assert_eq!(composed.len(), 2);

        let err = to_string.via(UntypedFlow::identity::<i32, u8>()).unwrap_err();
        match err {
            Error::CompositionType { upstream, downstream } => {
                assert_eq!(upstream, Port::of::<String, u8>());
                assert_eq!(downstream, Port::of::<i32, u8>());
            }
            other => panic!("expected CompositionType, got {other:?}"),
        }
    }

    #[test]
    fn test_into_typed_checks_signature() {
        let flow = FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x| x + 1).into_untyped();
        assert!(flow.accepts::<i32, NotUsed>());
        assert!(flow.clone().into_typed::<i32, NotUsed, String, NotUsed>().is_err());
        assert!(flow.clone().into_typed::<u32, NotUsed, i32, NotUsed>().is_err());
        let typed = flow.into_typed::<i32, NotUsed, i32, NotUsed>().unwrap();
        assert_eq!(typed.len(), 1);
    }

    #[tokio::test]
    async fn test_typed_round_trip_runs() {
        let untyped = UntypedFlow::identity::<i32, &str>()
            .via(FlowWithContext::<i32, &str, i32, &str>::create().map(|x| x * 3).into())
            .unwrap();
        let flow = untyped.into_typed::<i32, &str, i32, &str>().unwrap();
        let out = flow
            .materialize(&StreamEngine::default(), stream::iter(vec![PairedElement::new(2, "k")]))
            .collect_pairs()
            .await
            .unwrap();
        assert_eq!(out, vec![PairedElement::new(6, "k")]);
    }
}
