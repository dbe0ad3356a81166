//! Typed views over a materialized chain's output.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::propagator::erased::{restore, ErasedPair};
use crate::sink::ContextSink;
use crate::{PairedElement, Result};

const OUTLET: &str = "pipeline outlet";

/// The output of a running pipeline, as a stream of `(Out, COut)` pairs.
///
/// Pulling from the handle is what drives the pipeline. Dropping it cancels
/// everything still in flight.
pub struct PipelineHandle<Out, COut> {
    output: BoxStream<'static, Result<ErasedPair>>,
    _marker: PhantomData<fn() -> (Out, COut)>,
}

impl<Out, COut> PipelineHandle<Out, COut>
where
    Out: Send + 'static,
    COut: Send + 'static,
{
    /// Wrap an engine's output stream.
    pub fn new(output: BoxStream<'static, Result<ErasedPair>>) -> Self {
        Self {
            output,
            _marker: PhantomData,
        }
    }

    /// Drain the pipeline into a `Vec`.
    ///
    /// # Errors
    ///
    /// Returns the first failure; outputs emitted before it are discarded.
    pub async fn collect_pairs(mut self) -> Result<Vec<PairedElement<Out, COut>>> {
        let mut pairs = Vec::new();
        while let Some(pair) = self.next().await {
            pairs.push(pair?);
        }
        Ok(pairs)
    }

    /// Feed every output to `sink`, then complete it. Returns the number of pairs delivered.
    ///
    /// # Errors
    ///
    /// Stops at the first pipeline or sink failure; the sink is not completed.
    pub async fn run_into<S>(mut self, sink: &mut S) -> Result<usize>
    where
        S: ContextSink<Out, COut> + ?Sized,
    {
        let mut delivered = 0;
        while let Some(pair) = self.next().await {
            sink.accept(pair?).await?;
            delivered += 1;
        }
        sink.complete().await?;
        Ok(delivered)
    }

    /// Drive the pipeline on a tokio task, buffering up to `capacity` outputs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut self, capacity: usize) -> RunningPipeline<Out, COut> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(item) = self.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!("pipeline receiver dropped");
                    break;
                }
                if failed {
                    break;
                }
            }
        });
        RunningPipeline { rx, task }
    }
}

impl<Out, COut> Stream for PipelineHandle<Out, COut>
where
    Out: Send + 'static,
    COut: Send + 'static,
{
    type Item = Result<PairedElement<Out, COut>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.output
            .poll_next_unpin(cx)
            .map(|item| item.map(|pair| pair.and_then(|pair| restore(pair, OUTLET))))
    }
}

impl<Out, COut> fmt::Debug for PipelineHandle<Out, COut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("output", &std::any::type_name::<(Out, COut)>())
            .finish()
    }
}

/// A pipeline driven by its own tokio task.
///
/// Outputs are buffered in a bounded channel; when it is full the task stops
/// pulling, so backpressure still reaches the source. Dropping the
/// `RunningPipeline` aborts the task.
pub struct RunningPipeline<Out, COut> {
    rx: mpsc::Receiver<Result<PairedElement<Out, COut>>>,
    task: JoinHandle<()>,
}

impl<Out, COut> RunningPipeline<Out, COut> {
    /// Receive the next output, or `None` once the pipeline has finished.
    pub async fn recv(&mut self) -> Option<Result<PairedElement<Out, COut>>> {
        self.rx.recv().await
    }

    /// Stop the pipeline, dropping everything in flight.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the driving task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<Out, COut> Stream for RunningPipeline<Out, COut> {
    type Item = Result<PairedElement<Out, COut>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<Out, COut> Drop for RunningPipeline<Out, COut> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<Out, COut> fmt::Debug for RunningPipeline<Out, COut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
