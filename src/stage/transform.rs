//! Async transformation trait for suspend-capable stages.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

use crate::Result;

/// An async element-to-element transformation, such as a remote lookup.
///
/// Implementations never see the element's context; wrap them with
/// [`Stage::from_transform`](crate::Stage::from_transform) or
/// [`FlowWithContext::map_async_with`](crate::FlowWithContext::map_async_with).
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use context_flow::{Transform, Result};
///
/// struct Lookup;
///
/// #[async_trait]
/// impl Transform for Lookup {
///     type Input = u32;
///     type Output = String;
///
///     async fn transform(&self, id: u32) -> Result<String> {
///         Ok(format!("user-{id}"))
///     }
/// }
/// ```
#[async_trait]
pub trait Transform: Send + Sync {
    /// The input type for this transform.
    type Input: Send;
    /// The output type produced by this transform.
    type Output: Send;

    /// Transform one element.
    async fn transform(&self, input: Self::Input) -> Result<Self::Output>;

    /// Returns a human-readable name for this transform. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A transform constructed from an async closure.
///
/// # Example
///
/// ```rust
/// use context_flow::{LambdaTransform, Transform};
///
/// # tokio_test::block_on(async {
/// let double = LambdaTransform::new(|x: i32| async move {
///     Ok::<i32, context_flow::Error>(x * 2)
/// });
/// assert_eq!(double.transform(4).await.unwrap(), 8);
/// # });
/// ```
pub struct LambdaTransform<I, O, F> {
    f: F,
    name: Option<String>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> LambdaTransform<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    /// Create a new `LambdaTransform` from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: None,
            _phantom: PhantomData,
        }
    }

    /// Set a human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl<F, I, O, Fut> Transform for LambdaTransform<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn transform(&self, input: I) -> Result<O> {
        (self.f)(input).await
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("lambda_transform")
    }
}
