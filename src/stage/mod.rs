//! Context-unaware transformation stages.
//!
//! A [`Stage`] is the unit of transformation over plain elements. It never
//! sees a context: wrapping it in a
//! [`ContextPropagator`](crate::ContextPropagator) is what pairs its outputs
//! with contexts again. The operator logic is a closed set of variants, one per
//! [`StageKind`], and every stage declares its [`Multiplicity`] up front so the
//! propagator can pick a context rule before any element flows.

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::{Error, Result};

pub mod running;
pub mod transform;

pub use running::RunningStage;
pub use transform::{LambdaTransform, Transform};

/// The operator kinds a stage can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Exactly one output per input.
    Map,
    /// Zero or one output per input.
    Filter,
    /// Exactly one output per input, produced after suspension.
    MapAsync,
    /// One output per `size` inputs.
    Batch,
    /// Zero or more outputs per input.
    FlatMap,
    /// Exactly one output per input, computed from private running state.
    StatefulScan,
}

impl StageKind {
    /// A short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Map => "map",
            StageKind::Filter => "filter",
            StageKind::MapAsync => "map_async",
            StageKind::Batch => "batch",
            StageKind::FlatMap => "flat_map",
            StageKind::StatefulScan => "stateful_scan",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many outputs a stage may produce for a single input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    /// Exactly one.
    One,
    /// Zero or one.
    AtMostOne,
    /// Any number, decided per input.
    Many,
    /// Zero or one; one output is emitted for every `size` inputs.
    Batched(usize),
}

impl Multiplicity {
    /// The largest number of outputs a single input can yield, if bounded.
    pub fn upper_bound(&self) -> Option<usize> {
        match self {
            Multiplicity::One | Multiplicity::AtMostOne | Multiplicity::Batched(_) => Some(1),
            Multiplicity::Many => None,
        }
    }

    /// Whether `count` outputs for a single input are allowed.
    pub fn admits(&self, count: usize) -> bool {
        match self {
            Multiplicity::One => count == 1,
            Multiplicity::AtMostOne | Multiplicity::Batched(_) => count <= 1,
            Multiplicity::Many => true,
        }
    }
}

pub(crate) type MapFn<In, Out> = Arc<dyn Fn(In) -> Result<Out> + Send + Sync>;
pub(crate) type FilterFn<In, Out> = Arc<dyn Fn(In) -> Result<Option<Out>> + Send + Sync>;
pub(crate) type FlatMapFn<In, Out> = Arc<dyn Fn(In) -> Result<Vec<Out>> + Send + Sync>;
pub(crate) type AsyncFn<In, Out> = Arc<dyn Fn(In) -> BoxFuture<'static, Result<Out>> + Send + Sync>;
pub(crate) type ScanFn<In, Out> = Box<dyn FnMut(In) -> Result<Out> + Send>;
pub(crate) type ScanFactory<In, Out> = Arc<dyn Fn() -> ScanFn<In, Out> + Send + Sync>;

pub(crate) enum Logic<In, Out> {
    Map(MapFn<In, Out>),
    Filter(FilterFn<In, Out>),
    FlatMap(FlatMapFn<In, Out>),
    MapAsync { parallelism: usize, f: AsyncFn<In, Out> },
    Batch { size: usize, assemble: fn(Vec<In>) -> Out },
    Scan(ScanFactory<In, Out>),
}

impl<In, Out> Clone for Logic<In, Out> {
    fn clone(&self) -> Self {
        match self {
            Logic::Map(f) => Logic::Map(Arc::clone(f)),
            Logic::Filter(f) => Logic::Filter(Arc::clone(f)),
            Logic::FlatMap(f) => Logic::FlatMap(Arc::clone(f)),
            Logic::MapAsync { parallelism, f } => Logic::MapAsync {
                parallelism: *parallelism,
                f: Arc::clone(f),
            },
            Logic::Batch { size, assemble } => Logic::Batch {
                size: *size,
                assemble: *assemble,
            },
            Logic::Scan(factory) => Logic::Scan(Arc::clone(factory)),
        }
    }
}

/// An immutable description of one transformation over plain elements.
///
/// Stages are cheap to clone: the user functions live behind `Arc`s, and any
/// running state (batch buffers, scan accumulators) is created fresh by
/// [`Stage::start`] for every materialization.
///
/// # Example
///
/// ```rust
/// use context_flow::{Stage, StageKind};
///
/// let double = Stage::map("double", |x: i32| x * 2);
/// assert_eq!(double.kind(), StageKind::Map);
/// assert_eq!(double.apply(21).unwrap(), vec![42]);
///
/// let even = Stage::filter("even", |x: &i32| x % 2 == 0);
/// assert!(even.apply(3).unwrap().is_empty());
/// ```
pub struct Stage<In, Out> {
    name: String,
    logic: Logic<In, Out>,
}

impl<In, Out> Clone for Stage<In, Out> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            logic: self.logic.clone(),
        }
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("multiplicity", &self.multiplicity())
            .finish()
    }
}

impl<In, Out> Stage<In, Out> {
    /// The stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator kind, used to select a context propagation rule.
    pub fn kind(&self) -> StageKind {
        match &self.logic {
            Logic::Map(_) => StageKind::Map,
            Logic::Filter(_) => StageKind::Filter,
            Logic::FlatMap(_) => StageKind::FlatMap,
            Logic::MapAsync { .. } => StageKind::MapAsync,
            Logic::Batch { .. } => StageKind::Batch,
            Logic::Scan(_) => StageKind::StatefulScan,
        }
    }

    /// The declared output multiplicity.
    pub fn multiplicity(&self) -> Multiplicity {
        match &self.logic {
            Logic::Map(_) | Logic::MapAsync { .. } | Logic::Scan(_) => Multiplicity::One,
            Logic::Filter(_) => Multiplicity::AtMostOne,
            Logic::FlatMap(_) => Multiplicity::Many,
            Logic::Batch { size, .. } => Multiplicity::Batched(*size),
        }
    }

    /// How many suspended calls may be in flight at once. `1` for synchronous stages.
    pub fn parallelism(&self) -> usize {
        match &self.logic {
            Logic::MapAsync { parallelism, .. } => *parallelism,
            _ => 1,
        }
    }

    /// Whether this stage must be driven through [`Stage::apply_async`].
    pub fn is_async(&self) -> bool {
        matches!(self.logic, Logic::MapAsync { .. })
    }

    pub(crate) fn logic(&self) -> &Logic<In, Out> {
        &self.logic
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// A stage applying an infallible function.
    pub fn map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In) -> Out + Send + Sync + 'static,
    {
        Self::try_map(name, move |input| Ok(f(input)))
    }

    /// A stage applying a fallible function.
    pub fn try_map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In) -> Result<Out> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: Logic::Map(Arc::new(f)),
        }
    }

    /// A stage that maps and drops in one pass, keeping only `Some` results.
    pub fn filter_map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In) -> Option<Out> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: Logic::Filter(Arc::new(move |input: In| Ok::<_, Error>(f(input)))),
        }
    }

    /// A stage producing any number of outputs per input.
    pub fn flat_map<F, I>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Out>,
    {
        Self {
            name: name.into(),
            logic: Logic::FlatMap(Arc::new(move |input: In| {
                Ok::<Vec<Out>, Error>(f(input).into_iter().collect())
            })),
        }
    }

    /// A stage whose function suspends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `parallelism` is zero.
    pub fn map_async<F, Fut>(name: impl Into<String>, parallelism: usize, f: F) -> Result<Self>
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        let parallelism = validate_positive("parallelism", parallelism)?;
        Ok(Self {
            name: name.into(),
            logic: Logic::MapAsync {
                parallelism,
                f: Arc::new(move |input: In| f(input).boxed()),
            },
        })
    }

    /// A suspending stage backed by a [`Transform`] implementation.
    ///
    /// The stage takes the transform's name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `parallelism` is zero.
    pub fn from_transform<T>(parallelism: usize, transform: T) -> Result<Self>
    where
        T: Transform<Input = In, Output = Out> + 'static,
    {
        let name = transform.name().to_string();
        let transform = Arc::new(transform);
        Self::map_async(name, parallelism, move |input| {
            let transform = Arc::clone(&transform);
            async move { transform.transform(input).await }
        })
    }

    /// A stage carrying private state across inputs.
    ///
    /// `factory` is called once per materialization to build the stateful mapper.
    pub fn stateful<Factory, Mapper>(name: impl Into<String>, factory: Factory) -> Self
    where
        Factory: Fn() -> Mapper + Send + Sync + 'static,
        Mapper: FnMut(In) -> Result<Out> + Send + 'static,
    {
        Self {
            name: name.into(),
            logic: Logic::Scan(Arc::new(move || Box::new(factory()) as ScanFn<In, Out>)),
        }
    }

    /// A running fold that emits the accumulator after every input.
    ///
    /// The seed itself is never emitted.
    pub fn scan<F>(name: impl Into<String>, initial: Out, f: F) -> Self
    where
        Out: Clone + Sync,
        F: Fn(Out, In) -> Out + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::stateful(name, move || {
            let f = Arc::clone(&f);
            let mut acc = initial.clone();
            move |input: In| {
                acc = f(acc.clone(), input);
                Ok::<Out, Error>(acc.clone())
            }
        })
    }

    /// Apply a stateless synchronous stage to one input.
    ///
    /// # Errors
    ///
    /// Surfaces the stage function's error verbatim. Returns
    /// [`Error::Validation`] for async, batch and stateful stages, which need
    /// [`Stage::apply_async`] or a [`RunningStage`].
    pub fn apply(&self, input: In) -> Result<Vec<Out>> {
        match &self.logic {
            Logic::Map(f) => Ok(vec![f(input)?]),
            Logic::Filter(f) => Ok(f(input)?.into_iter().collect()),
            Logic::FlatMap(f) => f(input),
            Logic::MapAsync { .. } | Logic::Batch { .. } | Logic::Scan(_) => Err(Error::Validation(format!(
                "{} stage '{}' cannot be applied statelessly",
                self.kind(),
                self.name
            ))),
        }
    }

    /// Apply the stage to one input, possibly suspending.
    ///
    /// Synchronous stateless stages resolve immediately.
    pub fn apply_async(&self, input: In) -> BoxFuture<'static, Result<Vec<Out>>> {
        match &self.logic {
            Logic::MapAsync { f, .. } => f(input).map(|result| result.map(|out| vec![out])).boxed(),
            _ => future::ready(self.apply(input)).boxed(),
        }
    }

    /// Create the private running state for one materialization.
    pub fn start(&self) -> RunningStage<In, Out> {
        RunningStage::new(self)
    }
}

impl<T> Stage<T, Vec<T>>
where
    T: Send + 'static,
{
    /// A stage collecting `size` consecutive inputs into one output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `size` is zero.
    pub fn batch(name: impl Into<String>, size: usize) -> Result<Self> {
        let size = validate_positive("size", size)?;
        Ok(Self {
            name: name.into(),
            logic: Logic::Batch {
                size,
                assemble: |items| items,
            },
        })
    }
}

impl<T> Stage<T, T>
where
    T: Send + 'static,
{
    /// A stage keeping only inputs matching `predicate`.
    pub fn filter<P>(name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: Logic::Filter(Arc::new(move |input: T| {
                Ok::<_, Error>(predicate(&input).then_some(input))
            })),
        }
    }

    /// A pass-through stage.
    pub fn identity(name: impl Into<String>) -> Self {
        Self::try_map(name, Ok)
    }
}

pub(crate) fn validate_positive(argument: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::Validation(format!("{argument} must be greater than zero")));
    }
    Ok(value)
}
