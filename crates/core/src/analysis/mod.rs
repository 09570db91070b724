//! Behavioral digests built from recorded events.

pub mod aggregator;
pub mod sensitivity;
pub mod summary;

pub use aggregator::{AggregationError, LogAggregator, DEFAULT_AGENT_WINDOW_HOURS};
pub use sensitivity::{
    KeywordSensitivityClassifier, SensitivityClassifier, SensitivityFlag, ToolCategory,
};
pub use summary::{
    ClassificationContext, EnforcementAttempt, ExecutionSummary, ToolCallRecord, AGENT_WIDE_SCOPE,
};
