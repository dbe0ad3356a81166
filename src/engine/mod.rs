//! The execution boundary.
//!
//! Flows only describe pipelines. An [`ExecutionEngine`] receives a freshly
//! instantiated [`StageChain`] and a source of type-erased pairs, and is
//! responsible for demand propagation, concurrency and cancellation.
//! [`StreamEngine`] is the in-process implementation built on
//! `futures::Stream`.

use futures::stream::BoxStream;
use std::fmt;

use crate::flow::signature::Signature;
use crate::propagator::erased::{ErasedPair, ErasedPropagator};
use crate::propagator::StageDescriptor;
use crate::Result;

pub mod config;
pub mod handle;
pub mod stream;

pub use config::EngineConfig;
pub use handle::{PipelineHandle, RunningPipeline};
pub use stream::StreamEngine;

/// Runs a chain of context propagators over a stream of pairs.
///
/// Implementations must:
/// - pull from `source` only when downstream demands output;
/// - keep every pair together with its context from source to output;
/// - emit outputs of each stage in input order, even for async stages;
/// - yield a stage failure as `Err` and then end the stream;
/// - cancel outstanding work when the returned stream is dropped.
pub trait ExecutionEngine: Send + Sync {
    /// Wire `chain` to `source`, returning the chain's output stream.
    fn materialize(
        &self,
        chain: StageChain,
        source: BoxStream<'static, ErasedPair>,
    ) -> BoxStream<'static, Result<ErasedPair>>;
}

/// Freshly spawned propagators for one materialization of a flow.
pub struct StageChain {
    signature: Signature,
    propagators: Vec<Box<dyn ErasedPropagator>>,
}

impl StageChain {
    pub(crate) fn new(signature: Signature, propagators: Vec<Box<dyn ErasedPropagator>>) -> Self {
        Self { signature, propagators }
    }

    /// The declared input and output types of the whole chain.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// The propagators in execution order.
    pub fn descriptors(&self) -> Vec<StageDescriptor> {
        self.propagators.iter().map(|p| p.descriptor()).collect()
    }

    /// Number of propagators.
    pub fn len(&self) -> usize {
        self.propagators.len()
    }

    /// Whether the chain passes pairs straight through.
    pub fn is_empty(&self) -> bool {
        self.propagators.is_empty()
    }

    /// Hand the propagators to an engine.
    pub fn into_propagators(self) -> Vec<Box<dyn ErasedPropagator>> {
        self.propagators
    }
}

impl fmt::Debug for StageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageChain")
            .field("signature", &self.signature)
            .field("stages", &self.descriptors())
            .finish()
    }
}
