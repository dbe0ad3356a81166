//! The element/context pair carried through every context-aware flow.

use serde::{Deserialize, Serialize};

/// An element of type `E` tied to an opaque context of type `C`.
///
/// Stages never see the context: propagators split the pair, hand the value
/// to the stage, and re-attach the context to whatever comes out.
///
/// # Example
///
/// ```rust
/// use context_flow::PairedElement;
///
/// let pair = PairedElement::new(1, "offset-1");
/// let moved = pair.with_context("offset-2");
/// assert_eq!(*moved.value(), 1);
/// assert_eq!(*moved.context(), "offset-2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairedElement<E, C> {
    value: E,
    context: C,
}

impl<E, C> PairedElement<E, C> {
    /// Pair `value` with `context`.
    pub fn new(value: E, context: C) -> Self {
        Self { value, context }
    }

    /// The element.
    pub fn value(&self) -> &E {
        &self.value
    }

    /// The context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Replace the context, keeping the value.
    pub fn with_context<C2>(self, context: C2) -> PairedElement<E, C2> {
        PairedElement {
            value: self.value,
            context,
        }
    }

    /// Split into `(value, context)`.
    pub fn into_parts(self) -> (E, C) {
        (self.value, self.context)
    }
}

impl<E, C> From<(E, C)> for PairedElement<E, C> {
    fn from((value, context): (E, C)) -> Self {
        Self::new(value, context)
    }
}

impl<E, C> From<PairedElement<E, C>> for (E, C) {
    fn from(pair: PairedElement<E, C>) -> Self {
        pair.into_parts()
    }
}

/// Marker context for flows that carry no meaningful context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotUsed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_conversions() {
        let pair: PairedElement<i32, NotUsed> = (3, NotUsed).into();
        assert_eq!(pair.value(), &3);
        let (value, ctx): (i32, NotUsed) = pair.into();
        assert_eq!((value, ctx), (3, NotUsed));
    }

    #[test]
    fn test_serialization() {
        let pair = PairedElement::new("a".to_string(), 10u64);
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, r#"{"value":"a","context":10}"#);
    }
}
