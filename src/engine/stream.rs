//! In-process, pull-driven execution engine.
//!
//! Every propagator in a chain becomes one [`Stream`] adaptor polling the
//! adaptor before it. Nothing is pulled from the source until the consumer
//! polls, so a slow consumer backpressures the whole chain.

use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

use super::{EngineConfig, ExecutionEngine, StageChain};
use crate::events::PipelineEvent;
use crate::propagator::erased::{ErasedCompletion, ErasedPair, ErasedPropagator};
use crate::telemetry::Telemetry;
use crate::{Error, Result};

/// The reference [`ExecutionEngine`].
///
/// # Example
///
/// ```rust
/// use context_flow::{EngineConfig, FlowWithContext, PairedElement, StreamEngine, Telemetry};
/// use futures::stream;
///
/// # tokio_test::block_on(async {
/// let telemetry = Telemetry::new();
/// let engine = StreamEngine::new(EngineConfig::default()).with_telemetry(telemetry.clone());
///
/// let flow = FlowWithContext::<i32, u64, i32, u64>::create().filter(|x| *x > 1);
/// let source = stream::iter(vec![PairedElement::new(1, 10), PairedElement::new(2, 20)]);
/// let out = flow.materialize(&engine, source).collect_pairs().await.unwrap();
///
/// assert_eq!(out, vec![PairedElement::new(2, 20)]);
/// assert_eq!(telemetry.snapshot().elements_received, 2);
/// assert_eq!(telemetry.snapshot().elements_emitted, 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct StreamEngine {
    config: EngineConfig,
    telemetry: Option<Telemetry>,
}

impl StreamEngine {
    /// Create an engine with the given configuration and no telemetry.
    pub fn new(config: EngineConfig) -> Self {
        Self { config, telemetry: None }
    }

    /// Record metrics and events for every pipeline this engine runs.
    ///
    /// Trace recording follows [`EngineConfig::record_traces`].
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry.with_traces(self.config.record_traces));
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The attached telemetry, if any.
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_ref()
    }
}

impl ExecutionEngine for StreamEngine {
    fn materialize(
        &self,
        chain: StageChain,
        source: BoxStream<'static, ErasedPair>,
    ) -> BoxStream<'static, Result<ErasedPair>> {
        let stages: Vec<String> = chain.descriptors().into_iter().map(|d| d.name).collect();
        debug!(signature = %chain.signature(), ?stages, "materializing flow");

        let source = match &self.telemetry {
            Some(telemetry) => {
                telemetry.emit(PipelineEvent::Materialized { stages });
                let telemetry = telemetry.clone();
                source
                    .inspect(move |_| telemetry.record_received())
                    .map(Ok::<ErasedPair, Error>)
                    .boxed()
            }
            None => source.map(Ok::<ErasedPair, Error>).boxed(),
        };

        let output = chain
            .into_propagators()
            .into_iter()
            .fold(source, |upstream, propagator| {
                let parallelism = self.config.effective_parallelism(propagator.parallelism());
                StageDriver::new(upstream, propagator, parallelism).boxed()
            });

        match &self.telemetry {
            Some(telemetry) => Monitored::new(output, telemetry.clone()).boxed(),
            None => output,
        }
    }
}

/// Drives one propagator between an upstream stream and its consumer.
struct StageDriver {
    upstream: BoxStream<'static, Result<ErasedPair>>,
    propagator: Box<dyn ErasedPropagator>,
    parallelism: usize,
    in_flight: FuturesUnordered<BoxFuture<'static, ErasedCompletion>>,
    ready: VecDeque<ErasedPair>,
    upstream_done: bool,
    upstream_error: Option<Error>,
    failure: Option<Error>,
    finished: bool,
}

impl StageDriver {
    fn new(
        upstream: BoxStream<'static, Result<ErasedPair>>,
        propagator: Box<dyn ErasedPropagator>,
        parallelism: usize,
    ) -> Self {
        Self {
            upstream,
            propagator,
            parallelism,
            in_flight: FuturesUnordered::new(),
            ready: VecDeque::new(),
            upstream_done: false,
            upstream_error: None,
            failure: None,
            finished: false,
        }
    }

    fn stage(&self) -> String {
        self.propagator.descriptor().name
    }

    fn fail(&mut self, err: Error) -> Poll<Option<Result<ErasedPair>>> {
        self.finished = true;
        self.ready.clear();
        self.in_flight = FuturesUnordered::new();
        self.propagator.cancel();
        Poll::Ready(Some(Err(err)))
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let flushed = self.propagator.flush()?;
        if !flushed.is_empty() {
            trace!(stage = %self.stage(), count = flushed.len(), "flushed buffered output");
        }
        self.ready.extend(flushed);
        Ok(())
    }

    fn poll_sync(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<ErasedPair>>> {
        loop {
            if let Some(pair) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(pair)));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            match self.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(pair))) => match self.propagator.propagate(pair) {
                    Ok(outputs) => self.ready.extend(outputs),
                    Err(err) => return self.fail(err),
                },
                Poll::Ready(Some(Err(err))) => return self.fail(err),
                Poll::Ready(None) => {
                    if let Err(err) = self.finish() {
                        return self.fail(err);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_async(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<ErasedPair>>> {
        loop {
            if let Some(pair) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(pair)));
            }
            if let Some(err) = self.failure.take() {
                return self.fail(err);
            }
            if self.finished {
                return Poll::Ready(None);
            }

            // Completed results parked behind a slower head still hold their slot.
            while !self.upstream_done && self.propagator.in_flight() < self.parallelism {
                match self.upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(pair))) => {
                        let pending = self.propagator.propagate_async(pair);
                        self.in_flight.push(pending);
                    }
                    Poll::Ready(Some(Err(err))) => {
                        // Released once everything dispatched before it has been.
                        self.upstream_error = Some(err);
                        self.upstream_done = true;
                    }
                    Poll::Ready(None) => self.upstream_done = true,
                    Poll::Pending => break,
                }
            }

            let mut progressed = false;
            while let Poll::Ready(Some(completion)) = self.in_flight.poll_next_unpin(cx) {
                progressed = true;
                if let Err(err) = self.propagator.accept(completion) {
                    return self.fail(err);
                }
            }
            while let Some(result) = self.propagator.next_ready() {
                match result {
                    Ok(outputs) => self.ready.extend(outputs),
                    Err(err) => {
                        // Outputs released ahead of the failure still go out first.
                        self.failure = Some(err);
                        break;
                    }
                }
            }

            if !self.ready.is_empty() || self.failure.is_some() {
                continue;
            }
            if self.upstream_done && self.in_flight.is_empty() {
                if let Some(err) = self.upstream_error.take() {
                    return self.fail(err);
                }
                if let Err(err) = self.finish() {
                    return self.fail(err);
                }
                continue;
            }
            if progressed && !self.upstream_done {
                // Freed capacity: try pulling more before parking.
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl Stream for StageDriver {
    type Item = Result<ErasedPair>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.propagator.is_async() {
            this.poll_async(cx)
        } else {
            this.poll_sync(cx)
        }
    }
}

impl Drop for StageDriver {
    fn drop(&mut self) {
        if !self.finished {
            if !self.in_flight.is_empty() {
                debug!(stage = %self.stage(), in_flight = self.in_flight.len(), "dropping in-flight calls");
            }
            self.propagator.cancel();
        }
    }
}

/// Records output, failures and cancellation of a materialized chain.
struct Monitored {
    inner: BoxStream<'static, Result<ErasedPair>>,
    telemetry: Telemetry,
    emitted: usize,
    done: bool,
}

impl Monitored {
    fn new(inner: BoxStream<'static, Result<ErasedPair>>, telemetry: Telemetry) -> Self {
        Self {
            inner,
            telemetry,
            emitted: 0,
            done: false,
        }
    }
}

impl Stream for Monitored {
    type Item = Result<ErasedPair>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(_))) => {
                this.emitted += 1;
                this.telemetry.record_emitted();
            }
            Poll::Ready(Some(Err(err))) => {
                warn!(stage = ?err.stage(), error = %err, "pipeline failed");
                this.done = true;
                this.telemetry.record_failure(err.stage(), err.to_string());
            }
            Poll::Ready(None) => {
                debug!(elements_emitted = this.emitted, "pipeline completed");
                this.done = true;
                this.telemetry.emit(PipelineEvent::Completed {
                    elements_emitted: this.emitted,
                });
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for Monitored {
    fn drop(&mut self) {
        if !self.done {
            warn!(elements_emitted = self.emitted, "pipeline cancelled");
            self.telemetry.record_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowWithContext, NotUsed, PairedElement};
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pairs<E, C>(items: Vec<(E, C)>) -> Vec<PairedElement<E, C>> {
        items.into_iter().map(PairedElement::from).collect()
    }

    #[tokio::test]
    async fn test_map_async_releases_in_input_order() {
        let flow = FlowWithContext::<u64, &str, u64, &str>::create()
            .map_async(3, |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<u64, Error>(ms)
            })
            .unwrap()
            .map(|ms| ms * 10);
        let input = pairs(vec![(30, "c1"), (5, "c2"), (15, "c3")]);
        let out = flow
            .materialize(&StreamEngine::default(), stream::iter(input))
            .collect_pairs()
            .await
            .unwrap();
        assert_eq!(out, pairs(vec![(300, "c1"), (50, "c2"), (150, "c3")]));
    }

    #[tokio::test]
    async fn test_map_async_with_forced_completion_order() {
        let (tx1, rx1) = oneshot::channel::<u32>();
        let (tx2, rx2) = oneshot::channel::<u32>();
        let receivers = Arc::new(std::sync::Mutex::new(vec![Some(rx1), Some(rx2)]));

        let flow = FlowWithContext::<usize, char, usize, char>::create()
            .map_async(2, move |index| {
                let rx = receivers.lock().unwrap()[index].take().unwrap();
                async move { rx.await.map_err(|e| Error::Execution(e.to_string())) }
            })
            .unwrap();

        let handle = flow.materialize(&StreamEngine::default(), stream::iter(pairs(vec![(0, 'a'), (1, 'b')])));
        let collector = tokio::spawn(handle.collect_pairs());
        tokio::task::yield_now().await;
        tx2.send(20).unwrap();
        tokio::task::yield_now().await;
        tx1.send(10).unwrap();

        let out = collector.await.unwrap().unwrap();
        assert_eq!(out, pairs(vec![(10, 'a'), (20, 'b')]));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        let flow = FlowWithContext::<u32, u32, u32, u32>::create()
            .map_async(4, move |x| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<u32, Error>(x)
                }
            })
            .unwrap();

        let engine = StreamEngine::new(EngineConfig::default().with_parallelism_cap(2));
        let input: Vec<_> = (0..10).map(|i| PairedElement::new(i, i)).collect();
        let out = flow.materialize(&engine, stream::iter(input)).collect_pairs().await.unwrap();

        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|pair| pair.value() == pair.context()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_slow_head_bounds_pulled_elements() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = stream::iter(0..1000u32).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            PairedElement::new(i, i)
        });

        let flow = FlowWithContext::<u32, u32, u32, u32>::create()
            .map_async(2, |x| async move {
                if x == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<u32, Error>(x)
            })
            .unwrap();
        let mut handle = flow.materialize(&StreamEngine::default(), source);
        let polled = tokio::time::timeout(Duration::from_millis(50), handle.next()).await;
        assert!(polled.is_err());
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_map_async_failure_releases_earlier_outputs_first() {
        let flow = FlowWithContext::<u32, char, u32, char>::create()
            .map_async(3, |x| async move {
                match x {
                    0 => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(x)
                    }
                    1 => Err(Error::from("rejected")),
                    _ => Ok::<u32, Error>(x),
                }
            })
            .unwrap();
        let mut handle = flow.materialize(
            &StreamEngine::default(),
            stream::iter(pairs(vec![(0, 'a'), (1, 'b'), (2, 'c')])),
        );
        assert_eq!(handle.next().await.unwrap().unwrap(), PairedElement::new(0, 'a'));
        let err = handle.next().await.unwrap().unwrap_err();
        let failure = err.as_transformation().unwrap();
        assert_eq!(failure.stage(), "map_async");
        assert_eq!(failure.context::<char>(), Some(&'b'));
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_source_is_pulled_on_demand() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = stream::iter(0..100).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            PairedElement::new(i, NotUsed)
        });

        let flow = FlowWithContext::<i32, NotUsed, i32, NotUsed>::create().map(|x| x + 1);
        let mut handle = flow.materialize(&StreamEngine::default(), source);
        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(*first.value(), 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_terminates_stream() {
        let flow = FlowWithContext::<i32, u8, i32, u8>::create().try_map(|x| {
            if x == 2 {
                Err(Error::from("two"))
            } else {
                Ok(x)
            }
        });
        let mut handle = flow.materialize(
            &StreamEngine::default(),
            stream::iter(pairs(vec![(1, 1), (2, 2), (3, 3)])),
        );
        assert_eq!(handle.next().await.unwrap().unwrap(), PairedElement::new(1, 1));
        let err = handle.next().await.unwrap().unwrap_err();
        assert_eq!(err.as_transformation().unwrap().context::<u8>(), Some(&2));
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_failure_follows_earlier_async_results() {
        let flow = FlowWithContext::<i32, u8, i32, u8>::create()
            .try_map(|x| if x < 0 { Err(Error::from("negative")) } else { Ok(x) })
            .map_async(4, |x| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<i32, Error>(x * 2)
            })
            .unwrap();
        let mut handle = flow.materialize(
            &StreamEngine::default(),
            stream::iter(pairs(vec![(1, 1), (2, 2), (-1, 3)])),
        );
        assert_eq!(handle.next().await.unwrap().unwrap(), PairedElement::new(2, 1));
        assert_eq!(handle.next().await.unwrap().unwrap(), PairedElement::new(4, 2));
        assert!(handle.next().await.unwrap().is_err());
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_telemetry_records_run() {
        let telemetry = Telemetry::new();
        let engine = StreamEngine::default().with_telemetry(telemetry.clone());
        let flow = FlowWithContext::<i32, u8, i32, u8>::create().grouped(2).unwrap();
        let out = flow
            .materialize(&engine, stream::iter(pairs(vec![(1, 1), (2, 2), (3, 3)])))
            .collect_pairs()
            .await
            .unwrap();
        assert_eq!(out.len(), 2);

        let metrics = telemetry.snapshot();
        assert_eq!(metrics.elements_received, 3);
        assert_eq!(metrics.elements_emitted, 2);
        assert!(!metrics.cancelled);

        let events: Vec<PipelineEvent> = telemetry.trace_snapshot().into_iter().map(|t| t.event).collect();
        assert_eq!(
            events,
            vec![
                PipelineEvent::Materialized { stages: vec!["grouped".to_string()] },
                PipelineEvent::Completed { elements_emitted: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let telemetry = Telemetry::new();
        let engine = StreamEngine::default().with_telemetry(telemetry.clone());
        let flow = FlowWithContext::<u32, (), u32, ()>::create()
            .map_async(2, |x| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<u32, Error>(x)
            })
            .unwrap();
        let mut handle = flow.materialize(&engine, stream::iter((0..4).map(|i| PairedElement::new(i, ()))));
        let polled = tokio::time::timeout(Duration::from_millis(10), handle.next()).await;
        assert!(polled.is_err());
        drop(handle);

        let metrics = telemetry.snapshot();
        assert!(metrics.cancelled);
        assert_eq!(metrics.elements_received, 2);
        assert_eq!(telemetry.trace_snapshot().last().unwrap().event, PipelineEvent::Cancelled);
    }
}
