pub mod analysis;
pub mod config;
pub mod domain;
pub mod errors;
pub mod event_log;

pub use analysis::{
    AggregationError, ClassificationContext, ExecutionSummary, KeywordSensitivityClassifier,
    LogAggregator, SensitivityClassifier, SensitivityFlag, ToolCategory,
};
pub use domain::agent::{AgentDefinition, AgentPolicy, ToolDefinition, ToolId};
pub use domain::classification::{
    AnalysisWindow, Classification, ClassificationError, Intent, RiskLevel,
};
pub use domain::event::{
    Decision, EventPayload, EventRecord, EventType, RuntimeErrorKind, ToolCallStatus,
};
pub use domain::session::{AgentId, Session, SessionId, SessionStatus};
pub use errors::{ApplicationError, DomainError};
pub use event_log::{
    EventLog, EventLogError, EventStore, InMemoryEventStore, InMemorySessionRepository,
    LogFilter, LogPage, Page, SessionRepository, SortOrder,
};
