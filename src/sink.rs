//! Consumers at the end of a pipeline.
//!
//! Sinks receive each output together with its context, which is where
//! acknowledgment-style work happens: committing an offset, deleting a
//! message, replying to a request.

use async_trait::async_trait;
use std::future::Future;

use crate::{PairedElement, Result};

/// An async consumer of element/context pairs.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use context_flow::{ContextSink, PairedElement, Result};
///
/// struct CommitOffsets {
///     committed: Vec<u64>,
/// }
///
/// #[async_trait]
/// impl ContextSink<String, u64> for CommitOffsets {
///     async fn accept(&mut self, pair: PairedElement<String, u64>) -> Result<()> {
///         self.committed.push(*pair.context());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ContextSink<E, C>: Send
where
    E: Send + 'static,
    C: Send + 'static,
{
    /// Consume one pair.
    async fn accept(&mut self, pair: PairedElement<E, C>) -> Result<()>;

    /// Called once after the last pair. Does nothing by default.
    async fn complete(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A sink constructed from an async closure.
///
/// # Example
///
/// ```rust
/// use context_flow::{ContextSink, LambdaSink, PairedElement};
///
/// # tokio_test::block_on(async {
/// let mut sink = LambdaSink::new(|pair: PairedElement<i32, u64>| async move {
///     assert_eq!(*pair.context(), 7);
///     Ok::<(), context_flow::Error>(())
/// });
/// sink.accept(PairedElement::new(1, 7u64)).await.unwrap();
/// # });
/// ```
pub struct LambdaSink<F> {
    f: F,
    name: String,
}

impl<F> LambdaSink<F> {
    /// Create a new lambda sink.
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: "LambdaSink".to_string(),
        }
    }

    /// Set a custom name for this sink.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The sink name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<E, C, F, Fut> ContextSink<E, C> for LambdaSink<F>
where
    E: Send + 'static,
    C: Send + 'static,
    F: FnMut(PairedElement<E, C>) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn accept(&mut self, pair: PairedElement<E, C>) -> Result<()> {
        (self.f)(pair).await
    }
}

/// A sink that keeps every pair it receives.
#[derive(Debug)]
pub struct CollectSink<E, C> {
    items: Vec<PairedElement<E, C>>,
    completed: bool,
}

impl<E, C> Default for CollectSink<E, C> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            completed: false,
        }
    }
}

impl<E, C> CollectSink<E, C> {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs received so far.
    pub fn items(&self) -> &[PairedElement<E, C>] {
        &self.items
    }

    /// Whether upstream completed.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Take the received pairs.
    pub fn into_items(self) -> Vec<PairedElement<E, C>> {
        self.items
    }
}

#[async_trait]
impl<E, C> ContextSink<E, C> for CollectSink<E, C>
where
    E: Send + 'static,
    C: Send + 'static,
{
    async fn accept(&mut self, pair: PairedElement<E, C>) -> Result<()> {
        self.items.push(pair);
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.completed = true;
        Ok(())
    }
}
