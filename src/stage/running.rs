//! Per-materialization stage state.

use std::fmt;

use super::{Logic, ScanFn, Stage};
use crate::Result;

/// A [`Stage`] together with the private state one materialization needs.
///
/// Batch buffers and scan accumulators live here rather than in the stage, so
/// the same stage description can be materialized any number of times
/// without runs observing each other's state.
///
/// # Example
///
/// ```rust
/// use context_flow::Stage;
///
/// let mut running = Stage::<i32, Vec<i32>>::batch("pairs", 2).unwrap().start();
/// assert!(running.push(1).unwrap().is_empty());
/// assert_eq!(running.push(2).unwrap(), vec![vec![1, 2]]);
/// running.push(3).unwrap();
/// assert_eq!(running.finish(), vec![vec![3]]);
/// ```
pub struct RunningStage<In, Out> {
    stage: Stage<In, Out>,
    buffer: Vec<In>,
    mapper: Option<ScanFn<In, Out>>,
}

impl<In, Out> RunningStage<In, Out> {
    /// The stage this state belongs to.
    pub fn stage(&self) -> &Stage<In, Out> {
        &self.stage
    }

    /// Number of inputs held back waiting for a batch to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl<In, Out> RunningStage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(stage: &Stage<In, Out>) -> Self {
        let mapper = match stage.logic() {
            Logic::Scan(factory) => Some(factory()),
            _ => None,
        };
        Self {
            stage: stage.clone(),
            buffer: Vec::new(),
            mapper,
        }
    }

    /// Feed one input through a synchronous stage.
    ///
    /// # Errors
    ///
    /// Surfaces the stage function's error verbatim, and
    /// [`Error::Validation`](crate::Error::Validation) for async stages.
    pub fn push(&mut self, input: In) -> Result<Vec<Out>> {
        match self.stage.logic() {
            Logic::Batch { size, assemble } => {
                self.buffer.push(input);
                if self.buffer.len() < *size {
                    return Ok(Vec::new());
                }
                let items = std::mem::take(&mut self.buffer);
                Ok(vec![assemble(items)])
            }
            Logic::Scan(_) => match self.mapper.as_mut() {
                Some(mapper) => Ok(vec![mapper(input)?]),
                None => Err(crate::Error::invariant(self.stage.name(), "scan state missing")),
            },
            _ => self.stage.apply(input),
        }
    }

    /// Emit whatever is still buffered once upstream is exhausted.
    pub fn finish(&mut self) -> Vec<Out> {
        match self.stage.logic() {
            Logic::Batch { assemble, .. } if !self.buffer.is_empty() => {
                vec![assemble(std::mem::take(&mut self.buffer))]
            }
            _ => Vec::new(),
        }
    }

    /// Drop buffered inputs without emitting them.
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}

impl<In, Out> fmt::Debug for RunningStage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningStage")
            .field("stage", &self.stage)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
