//! Error types for flow composition and execution.

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::flow::signature::Port;

/// The main error type for flow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Two flows were composed whose element or context types do not line up.
    #[error("Composition type error: upstream emits {upstream} but downstream expects {downstream}")]
    CompositionType {
        /// The output port of the upstream flow.
        upstream: Port,
        /// The input port of the downstream flow.
        downstream: Port,
    },

    /// A user-supplied stage function failed.
    #[error(transparent)]
    Transformation(#[from] Box<TransformationError>),

    /// A propagator broke its own element/context pairing rules.
    #[error("Invariant violated in stage '{stage}': {detail}")]
    InvariantViolation {
        /// The name of the offending stage.
        stage: String,
        /// What went wrong.
        detail: String,
    },

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The pipeline was cancelled before completion.
    #[error("Pipeline cancelled")]
    Cancelled,

    /// An error occurred during execution.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub(crate) fn invariant(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::InvariantViolation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Returns the transformation failure, if this is one.
    pub fn as_transformation(&self) -> Option<&TransformationError> {
        match self {
            Error::Transformation(err) => Some(err),
            _ => None,
        }
    }

    /// The stage the error was raised in, when one is known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Error::Transformation(err) => Some(err.stage()),
            Error::InvariantViolation { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

impl From<TransformationError> for Error {
    fn from(err: TransformationError) -> Self {
        Error::Transformation(Box::new(err))
    }
}

/// A stage function failure, tagged with the context of the input that caused it.
///
/// The context is kept type-erased so that a failure raised deep inside a
/// chain can travel to the caller regardless of which context type that
/// particular stage consumed. Recover it with [`TransformationError::context`].
///
/// # Example
///
/// ```rust
/// use context_flow::{Error, TransformationError};
///
/// let err = TransformationError::new("parse", 42u64, Error::from("bad input"));
/// assert_eq!(err.stage(), "parse");
/// assert_eq!(err.context::<u64>(), Some(&42));
/// assert!(err.context::<String>().is_none());
/// ```
#[derive(Error)]
#[error("Transformation error in stage '{stage}': {source}")]
pub struct TransformationError {
    stage: String,
    context: Box<dyn Any + Send>,
    context_type: &'static str,
    #[source]
    source: Error,
}

impl TransformationError {
    /// Create a transformation error for the given stage and input context.
    pub fn new<C>(stage: impl Into<String>, context: C, source: Error) -> Self
    where
        C: Send + 'static,
    {
        Self {
            stage: stage.into(),
            context: Box::new(context),
            context_type: std::any::type_name::<C>(),
            source,
        }
    }

    /// The name of the stage that failed.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The underlying error raised by the stage function.
    pub fn cause(&self) -> &Error {
        &self.source
    }

    /// The Rust type name of the carried context.
    pub fn context_type(&self) -> &'static str {
        self.context_type
    }

    /// Borrow the carried context if it is a `C`.
    pub fn context<C: 'static>(&self) -> Option<&C> {
        self.context.downcast_ref::<C>()
    }

    /// Take the carried context out, returning `self` unchanged if it is not a `C`.
    pub fn into_context<C: 'static>(self) -> std::result::Result<C, Self> {
        let Self {
            stage,
            context,
            context_type,
            source,
        } = self;
        match context.downcast::<C>() {
            Ok(ctx) => Ok(*ctx),
            Err(context) => Err(Self {
                stage,
                context,
                context_type,
                source,
            }),
        }
    }
}

impl fmt::Debug for TransformationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationError")
            .field("stage", &self.stage)
            .field("context_type", &self.context_type)
            .field("source", &self.source)
            .finish()
    }
}

/// A specialized `Result` type for flow operations.
pub type Result<T> = std::result::Result<T, Error>;
