//! Metrics collection for pipeline runs.
//!
//! This module provides `PipelineMetrics` for tracking element throughput,
//! failures and cancellation.

use serde::{Deserialize, Serialize};

/// Aggregated metrics for one or more pipeline runs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Pairs pulled from the source.
    pub elements_received: usize,
    /// Pairs emitted at the end of the flow.
    pub elements_emitted: usize,
    /// Collected failure messages.
    pub failures: Vec<String>,
    /// Whether a run was dropped before it completed.
    pub cancelled: bool,
}

impl PipelineMetrics {
    /// Count one pair pulled from the source.
    pub fn record_received(&mut self) {
        self.elements_received += 1;
    }

    /// Count one pair emitted downstream.
    pub fn record_emitted(&mut self) {
        self.elements_emitted += 1;
    }

    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Mark the run as cancelled.
    pub fn record_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Pairs received but not emitted: filtered, batched together, or lost to a failure.
    pub fn absorbed(&self) -> usize {
        self.elements_received.saturating_sub(self.elements_emitted)
    }
}
