//! Declared element/context types of flows and propagators.

use serde::{Serialize, Serializer};
use std::any::TypeId;
use std::fmt;

/// A runtime handle on a Rust type, compared by `TypeId`.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// The tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The Rust type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name)
    }
}

/// One side of a flow: an element type and the context type travelling with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Port {
    /// Element type.
    pub element: TypeTag,
    /// Context type.
    pub context: TypeTag,
}

impl Port {
    /// The port carrying `E` elements with `C` contexts.
    pub fn of<E: 'static, C: 'static>() -> Self {
        Self {
            element: TypeTag::of::<E>(),
            context: TypeTag::of::<C>(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.element, self.context)
    }
}

/// The declared input and output ports of a flow or propagator.
///
/// # Example
///
/// ```rust
/// use context_flow::{NotUsed, Signature};
///
/// let sig = Signature::of::<i32, NotUsed, String, NotUsed>();
/// assert!(sig.feeds(&Signature::of::<String, NotUsed, usize, NotUsed>()));
/// assert!(!sig.feeds(&Signature::of::<i32, NotUsed, i32, NotUsed>()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Signature {
    /// What the flow consumes.
    pub inlet: Port,
    /// What the flow emits.
    pub outlet: Port,
}

impl Signature {
    /// The signature `(In, CIn) -> (Out, COut)`.
    pub fn of<In: 'static, CIn: 'static, Out: 'static, COut: 'static>() -> Self {
        Self {
            inlet: Port::of::<In, CIn>(),
            outlet: Port::of::<Out, COut>(),
        }
    }

    /// The pass-through signature `(T, C) -> (T, C)`.
    pub fn identity<T: 'static, C: 'static>() -> Self {
        Self::of::<T, C, T, C>()
    }

    /// Whether this outlet matches `downstream`'s inlet exactly.
    pub fn feeds(&self, downstream: &Signature) -> bool {
        self.outlet == downstream.inlet
    }

    /// The signature of `self` followed by `downstream`.
    pub fn then(&self, downstream: &Signature) -> Signature {
        Signature {
            inlet: self.inlet,
            outlet: downstream.outlet,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inlet, self.outlet)
    }
}
