//! Structured pipeline events for tracing and observability.
//!
//! These events are recorded by an engine's [`Telemetry`](crate::Telemetry)
//! as a pipeline is materialized, fails, completes or is cancelled.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Events that can be emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    /// A flow was materialized into a running pipeline.
    Materialized {
        /// Stage names in execution order.
        stages: Vec<String>,
    },
    /// A stage failed and the pipeline terminated.
    StageFailed {
        /// Name of the failing stage, when known.
        stage: Option<String>,
        /// Error message describing what went wrong.
        message: String,
    },
    /// Upstream completed and every output was emitted.
    Completed {
        /// Pairs emitted by this run.
        elements_emitted: usize,
    },
    /// The pipeline was dropped before completing.
    Cancelled,
}

/// A timestamped trace entry containing a pipeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The recorded event.
    #[serde(flatten)]
    pub event: PipelineEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: PipelineEvent) -> Self {
        // A clock before the epoch records as zero.
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_entry_serialization() {
        let entry = TraceEntry::new(PipelineEvent::Materialized {
            stages: vec!["map".to_string(), "grouped".to_string()],
        });

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"Materialized\""));
        assert!(json.contains("\"stages\":[\"map\",\"grouped\"]"));
        assert!(json.contains("\"timestamp\":"));
    }

    #[test]
    fn test_failure_event() {
        let event = PipelineEvent::StageFailed {
            stage: Some("parse".to_string()),
            message: "bad input".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"StageFailed\""));
        assert!(json.contains("\"stage\":\"parse\""));

        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
