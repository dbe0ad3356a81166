//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default bound for channels between a spawned pipeline and its consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Tuning knobs for [`StreamEngine`](crate::StreamEngine).
///
/// Missing fields take their defaults when deserializing.
///
/// # Example
///
/// ```rust
/// use context_flow::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(r#"{ "parallelism_cap": 2 }"#).unwrap();
/// assert_eq!(config.effective_parallelism(8), 2);
/// assert_eq!(config.channel_capacity, 16);
/// assert!(config.record_traces);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound applied to every async stage's parallelism.
    pub parallelism_cap: Option<usize>,
    /// Bound of the output channel used when a pipeline is spawned.
    pub channel_capacity: usize,
    /// Whether telemetry records trace events.
    pub record_traces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism_cap: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            record_traces: true,
        }
    }
}

impl EngineConfig {
    /// Cap async parallelism at `cap`. A cap of zero is treated as one.
    #[must_use]
    pub fn with_parallelism_cap(mut self, cap: usize) -> Self {
        self.parallelism_cap = Some(cap);
        self
    }

    /// Set the spawned-pipeline channel bound. Zero is treated as one.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Enable or disable trace recording.
    #[must_use]
    pub fn with_traces(mut self, record_traces: bool) -> Self {
        self.record_traces = record_traces;
        self
    }

    /// The parallelism an async stage declaring `declared` actually gets.
    pub fn effective_parallelism(&self, declared: usize) -> usize {
        let declared = declared.max(1);
        match self.parallelism_cap {
            Some(cap) => declared.min(cap.max(1)),
            None => declared,
        }
    }

    /// The channel bound actually used.
    pub fn effective_channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
