//! High-level pipeline container with automatic metrics collection.

use futures::stream;

use crate::engine::{EngineConfig, RunningPipeline, StreamEngine};
use crate::{FlowWithContext, PairedElement, PipelineMetrics, Result, Telemetry};

/// A named flow plus the engine settings to run it with.
///
/// `Pipeline` creates a fresh [`Telemetry`] for each run and returns both the
/// outputs and the accumulated [`PipelineMetrics`].
///
/// # Example
///
/// ```rust
/// use context_flow::{FlowWithContext, PairedElement, Pipeline};
///
/// # tokio_test::block_on(async {
/// let flow = FlowWithContext::<i32, u64, i32, u64>::create().map(|x| x * 2).filter(|x| *x > 2);
/// let pipeline = Pipeline::new(flow).with_name("DoubleAndDrop");
///
/// let (out, metrics) = pipeline
///     .run(vec![PairedElement::new(1, 10), PairedElement::new(2, 20)])
///     .await
///     .unwrap();
/// assert_eq!(out, vec![PairedElement::new(4, 20)]);
/// assert_eq!(metrics.elements_received, 2);
/// assert_eq!(metrics.elements_emitted, 1);
/// # });
/// ```
pub struct Pipeline<In, CIn, Out, COut> {
    flow: FlowWithContext<In, CIn, Out, COut>,
    name: String,
    config: EngineConfig,
}

impl<In, CIn, Out, COut> Pipeline<In, CIn, Out, COut>
where
    In: Send + 'static,
    CIn: Send + 'static,
    Out: Send + 'static,
    COut: Send + 'static,
{
    /// Create a new pipeline running `flow` with the default configuration.
    pub fn new(flow: FlowWithContext<In, CIn, Out, COut>) -> Self {
        Self {
            flow,
            name: "pipeline".to_string(),
            config: EngineConfig::default(),
        }
    }

    /// Set a human-readable name for this pipeline.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use `config` for every run.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the name of this pipeline.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flow this pipeline runs.
    pub fn flow(&self) -> &FlowWithContext<In, CIn, Out, COut> {
        &self.flow
    }

    fn engine(&self, telemetry: &Telemetry) -> StreamEngine {
        StreamEngine::new(self.config.clone()).with_telemetry(telemetry.clone())
    }

    /// Run the pipeline over `inputs`, returning the outputs along with the collected metrics.
    ///
    /// A fresh [`Telemetry`] is created for each invocation.
    pub async fn run<I>(&self, inputs: I) -> Result<(Vec<PairedElement<Out, COut>>, PipelineMetrics)>
    where
        I: IntoIterator<Item = PairedElement<In, CIn>>,
        I::IntoIter: Send + 'static,
    {
        let telemetry = Telemetry::new();
        let outputs = self.run_with_telemetry(&telemetry, inputs).await?;
        Ok((outputs, telemetry.snapshot()))
    }

    /// Run the pipeline with a caller-provided telemetry recorder.
    ///
    /// Useful when you want to share a recorder across multiple runs to
    /// accumulate metrics.
    pub async fn run_with_telemetry<I>(&self, telemetry: &Telemetry, inputs: I) -> Result<Vec<PairedElement<Out, COut>>>
    where
        I: IntoIterator<Item = PairedElement<In, CIn>>,
        I::IntoIter: Send + 'static,
    {
        tracing::debug!(pipeline = %self.name, stages = self.flow.len(), "running pipeline");
        self.flow
            .materialize(&self.engine(telemetry), stream::iter(inputs))
            .collect_pairs()
            .await
    }

    /// Run the pipeline on a tokio task, buffering outputs in a channel of
    /// the configured capacity.
    pub fn spawn<I>(&self, telemetry: &Telemetry, inputs: I) -> RunningPipeline<Out, COut>
    where
        I: IntoIterator<Item = PairedElement<In, CIn>>,
        I::IntoIter: Send + 'static,
    {
        self.flow
            .materialize(&self.engine(telemetry), stream::iter(inputs))
            .spawn(self.config.effective_channel_capacity())
    }

    /// Consume the pipeline, returning the inner flow.
    pub fn into_inner(self) -> FlowWithContext<In, CIn, Out, COut> {
        self.flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, PipelineEvent};

    #[tokio::test]
    async fn test_pipeline_reports_failure() {
        let flow = FlowWithContext::<&str, u32, &str, u32>::create()
            .try_map(|s| s.parse::<i32>().map_err(|e| Error::Execution(e.to_string())));
        let pipeline = Pipeline::new(flow).with_name("Parse");
        assert_eq!(pipeline.name(), "Parse");

        let telemetry = Telemetry::new();
        let err = pipeline
            .run_with_telemetry(&telemetry, vec![PairedElement::new("1", 1), PairedElement::new("x", 2)])
            .await
            .unwrap_err();
        assert_eq!(err.as_transformation().unwrap().context::<u32>(), Some(&2));

        let metrics = telemetry.snapshot();
        assert!(metrics.has_failures());
        assert_eq!(metrics.elements_emitted, 1);
        assert!(telemetry
            .trace_snapshot()
            .iter()
            .any(|t| matches!(&t.event, PipelineEvent::StageFailed { stage: Some(s), .. } if s == "try_map")));
    }

    #[tokio::test]
    async fn test_shared_telemetry_accumulates() {
        let pipeline = Pipeline::new(FlowWithContext::<i32, (), i32, ()>::create().map(|x| x + 1))
            .with_config(EngineConfig::default().with_traces(false));
        let telemetry = Telemetry::new();
        for _ in 0..2 {
            pipeline
                .run_with_telemetry(&telemetry, vec![PairedElement::new(1, ())])
                .await
                .unwrap();
        }
        assert_eq!(telemetry.snapshot().elements_emitted, 2);
        assert!(telemetry.trace_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_spawn() {
        let pipeline = Pipeline::new(FlowWithContext::<i32, char, i32, char>::create().grouped(2).unwrap());
        let mut running = pipeline.spawn(&Telemetry::new(), (0..3).map(|i| PairedElement::new(i, 'x')));
        assert_eq!(running.recv().await.unwrap().unwrap(), PairedElement::new(vec![0, 1], vec!['x', 'x']));
        assert_eq!(running.recv().await.unwrap().unwrap(), PairedElement::new(vec![2], vec!['x']));
        assert!(running.recv().await.is_none());
    }
}
