//! Shared metrics and trace recorder for pipeline runs.
//!
//! A [`Telemetry`] is handed to a [`StreamEngine`](crate::StreamEngine) and
//! updated by every pipeline that engine materializes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::{PipelineEvent, TraceEntry};
use crate::metrics::PipelineMetrics;
use crate::Result;

/// Cloneable, thread-safe recorder of [`PipelineMetrics`] and [`TraceEntry`]s.
///
/// Clones share the same underlying state, so a caller can keep one handle
/// while the engine updates another.
///
/// # Example
///
/// ```rust
/// use context_flow::{PipelineEvent, Telemetry};
///
/// let telemetry = Telemetry::new();
/// telemetry.emit(PipelineEvent::Materialized { stages: vec!["map".to_string()] });
/// telemetry.record_received();
///
/// assert_eq!(telemetry.snapshot().elements_received, 1);
/// assert_eq!(telemetry.trace_snapshot().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Telemetry {
    metrics: Arc<Mutex<PipelineMetrics>>,
    traces: Arc<Mutex<Vec<TraceEntry>>>,
    record_traces: bool,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Telemetry {
    /// Create a recorder with empty metrics and traces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(PipelineMetrics::default())),
            traces: Arc::new(Mutex::new(Vec::new())),
            record_traces: true,
        }
    }

    /// Enable or disable trace recording. Metrics are always kept.
    #[must_use]
    pub fn with_traces(mut self, record_traces: bool) -> Self {
        self.record_traces = record_traces;
        self
    }

    /// Count one pair pulled from a source.
    pub fn record_received(&self) {
        lock(&self.metrics).record_received();
    }

    /// Count one pair emitted by a pipeline.
    pub fn record_emitted(&self) {
        lock(&self.metrics).record_emitted();
    }

    /// Record a failure, both as a metric and as a trace event.
    pub fn record_failure(&self, stage: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        lock(&self.metrics).record_failure(message.clone());
        self.emit(PipelineEvent::StageFailed {
            stage: stage.map(str::to_string),
            message,
        });
    }

    /// Record that a run was dropped before completing.
    pub fn record_cancelled(&self) {
        lock(&self.metrics).record_cancelled();
        self.emit(PipelineEvent::Cancelled);
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetrics {
        lock(&self.metrics).clone()
    }

    /// Append a timestamped event to the trace log.
    pub fn emit(&self, event: PipelineEvent) {
        if self.record_traces {
            lock(&self.traces).push(TraceEntry::new(event));
        }
    }

    /// Get a snapshot of the current trace log.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        lock(&self.traces).clone()
    }

    /// Clear all trace entries.
    pub fn clear_traces(&self) {
        lock(&self.traces).clear();
    }

    /// Serialize the trace log as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.trace_snapshot())?)
    }
}
