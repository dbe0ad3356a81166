//! # context-flow
//!
//! Context-propagating flow composition for stream pipelines in Rust.
//!
//! Every element travelling through a pipeline can carry an opaque context:
//! a message offset, a request id, a reply handle. Stages are written against
//! plain elements; this crate pairs their outputs with the right contexts
//! again, so the context arrives at the end of the pipeline attached to the
//! element derived from it.
//!
//! ## Core Concepts
//!
//! - **PairedElement**: an element together with its context
//! - **Stage**: a context-unaware transformation (map, filter, flat map, batch, scan, async map)
//! - **ContextPropagator**: a stage lifted to operate on pairs
//! - **FlowWithContext**: an immutable, composable sequence of propagators
//! - **ExecutionEngine**: runs a flow; **StreamEngine** is the in-process one
//! - **SourceWithContext** / **ContextSink**: the ends of a pipeline
//! - **Pipeline**: high-level container with automatic metrics collection
//!
//! ## Example: Composing Flows
//!
//! ```rust
//! use context_flow::{FlowWithContext, NotUsed, PairedElement, Pipeline};
//!
//! # tokio_test::block_on(async {
//! let identity: FlowWithContext<i32, NotUsed, i32, NotUsed> = FlowWithContext::create();
//! let render = FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x| x.to_string());
//! let flow = identity.via(render);
//!
//! let pipeline = Pipeline::new(flow).with_name("Render");
//! let (out, metrics) = pipeline
//!     .run(vec![PairedElement::new(1, NotUsed), PairedElement::new(2, NotUsed)])
//!     .await
//!     .unwrap();
//!
//! assert_eq!(out, vec![
//!     PairedElement::new("1".to_string(), NotUsed),
//!     PairedElement::new("2".to_string(), NotUsed),
//! ]);
//! assert_eq!(metrics.elements_emitted, 2);
//! # });
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod metrics;
pub mod paired;
pub mod pipeline;
pub mod propagator;
pub mod sink;
pub mod source;
pub mod stage;
pub mod telemetry;

pub use error::{Error, Result, TransformationError};
pub use events::{PipelineEvent, TraceEntry};
pub use metrics::PipelineMetrics;
pub use paired::{NotUsed, PairedElement};
pub use pipeline::Pipeline;
pub use sink::{CollectSink, ContextSink, LambdaSink};
pub use source::SourceWithContext;
pub use telemetry::Telemetry;

// Re-export composition types
pub use engine::{EngineConfig, ExecutionEngine, PipelineHandle, RunningPipeline, StageChain, StreamEngine};
pub use flow::signature::{Port, Signature, TypeTag};
pub use flow::{FlowWithContext, UntypedFlow};
pub use propagator::{Completion, ContextPropagator, PropagationRule, ReorderBuffer, StageDescriptor};
pub use stage::{LambdaTransform, Multiplicity, RunningStage, Stage, StageKind, Transform};
