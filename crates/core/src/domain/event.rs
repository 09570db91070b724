use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::classification::{AnalysisWindow, Classification};
use super::session::{AgentId, SessionId, SessionStatus};
use crate::errors::DomainError;

/// Closed read-side enumeration of event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    NodeTransition,
    ToolCall,
    ToolCallAttempt,
    ToolCallResult,
    EnforcementDecision,
    RuntimeError,
    SessionEnd,
    ThreatClassification,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        Self::SessionStart,
        Self::NodeTransition,
        Self::ToolCall,
        Self::ToolCallAttempt,
        Self::ToolCallResult,
        Self::EnforcementDecision,
        Self::RuntimeError,
        Self::SessionEnd,
        Self::ThreatClassification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::NodeTransition => "node_transition",
            Self::ToolCall => "tool_call",
            Self::ToolCallAttempt => "tool_call_attempt",
            Self::ToolCallResult => "tool_call_result",
            Self::EnforcementDecision => "enforcement_decision",
            Self::RuntimeError => "runtime_error",
            Self::SessionEnd => "session_end",
            Self::ThreatClassification => "threat_classification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|event_type| event_type.as_str() == normalized)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Error,
    Blocked,
    Paused,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Block,
    Pause,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Pause => "pause",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    ReasoningError,
    NoMessages,
    ToolNotFound,
    InvalidParameters,
    ToolExecutionError,
    InternalError,
}

impl RuntimeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReasoningError => "reasoning_error",
            Self::NoMessages => "no_messages",
            Self::ToolNotFound => "tool_not_found",
            Self::InvalidParameters => "invalid_parameters",
            Self::ToolExecutionError => "tool_execution_error",
            Self::InternalError => "internal_error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartPayload {
    pub user_input: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransitionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallAttemptPayload {
    pub tool: String,
    pub attempt: u32,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResultPayload {
    pub tool: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementDecisionPayload {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<i64>,
    pub decision: Decision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeErrorPayload {
    pub error_type: RuntimeErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndPayload {
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreatClassificationPayload {
    #[serde(flatten)]
    pub classification: Classification,
    pub analysis_window: AnalysisWindow,
    pub classification_timestamp: DateTime<Utc>,
}

/// Typed payload for each event type, plus an escape hatch for writers that
/// emit types outside the closed enumeration.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    SessionStart(SessionStartPayload),
    NodeTransition(NodeTransitionPayload),
    ToolCall(ToolCallPayload),
    ToolCallAttempt(ToolCallAttemptPayload),
    ToolCallResult(ToolCallResultPayload),
    EnforcementDecision(EnforcementDecisionPayload),
    RuntimeError(RuntimeErrorPayload),
    SessionEnd(SessionEndPayload),
    ThreatClassification(ThreatClassificationPayload),
    Extension { event_type: String, data: Value },
}

impl EventPayload {
    pub fn known_type(&self) -> Option<EventType> {
        match self {
            Self::SessionStart(_) => Some(EventType::SessionStart),
            Self::NodeTransition(_) => Some(EventType::NodeTransition),
            Self::ToolCall(_) => Some(EventType::ToolCall),
            Self::ToolCallAttempt(_) => Some(EventType::ToolCallAttempt),
            Self::ToolCallResult(_) => Some(EventType::ToolCallResult),
            Self::EnforcementDecision(_) => Some(EventType::EnforcementDecision),
            Self::RuntimeError(_) => Some(EventType::RuntimeError),
            Self::SessionEnd(_) => Some(EventType::SessionEnd),
            Self::ThreatClassification(_) => Some(EventType::ThreatClassification),
            Self::Extension { .. } => None,
        }
    }

    /// Name written to the `event_type` column.
    pub fn event_type_name(&self) -> &str {
        match self {
            Self::Extension { event_type, .. } => event_type,
            other => other.known_type().map(|event_type| event_type.as_str()).unwrap_or_default(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::NodeTransition(payload) => require_text("node_transition.to", &payload.to),
            Self::ToolCall(payload) => require_text("tool_call.tool", &payload.tool),
            Self::ToolCallAttempt(payload) => {
                require_text("tool_call_attempt.tool", &payload.tool)?;
                require_attempt("tool_call_attempt.attempt", payload.attempt)
            }
            Self::ToolCallResult(payload) => {
                require_text("tool_call_result.tool", &payload.tool)?;
                require_attempt("tool_call_result.attempt", payload.attempt)
            }
            Self::EnforcementDecision(payload) => {
                require_text("enforcement_decision.tool_name", &payload.tool_name)?;
                require_text("enforcement_decision.reason", &payload.reason)
            }
            Self::ThreatClassification(payload) => {
                let classification = &payload.classification;
                Classification::new(
                    classification.risk_level,
                    classification.intent,
                    classification.confidence,
                    classification.explanation.clone(),
                )
                .map_err(|error| DomainError::InvariantViolation(error.to_string()))?;
                if payload.analysis_window.start > payload.analysis_window.end {
                    return Err(DomainError::InvariantViolation(
                        "threat_classification.analysis_window starts after it ends".to_owned(),
                    ));
                }
                Ok(())
            }
            Self::Extension { event_type, .. } => {
                require_text("extension.event_type", event_type)?;
                if EventType::parse(event_type).is_some() {
                    return Err(DomainError::InvariantViolation(format!(
                        "extension event type `{event_type}` shadows a built-in type"
                    )));
                }
                Ok(())
            }
            Self::SessionStart(_) | Self::RuntimeError(_) | Self::SessionEnd(_) => Ok(()),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::SessionStart(payload) => serde_json::to_value(payload),
            Self::NodeTransition(payload) => serde_json::to_value(payload),
            Self::ToolCall(payload) => serde_json::to_value(payload),
            Self::ToolCallAttempt(payload) => serde_json::to_value(payload),
            Self::ToolCallResult(payload) => serde_json::to_value(payload),
            Self::EnforcementDecision(payload) => serde_json::to_value(payload),
            Self::RuntimeError(payload) => serde_json::to_value(payload),
            Self::SessionEnd(payload) => serde_json::to_value(payload),
            Self::ThreatClassification(payload) => serde_json::to_value(payload),
            Self::Extension { data, .. } => Ok(data.clone()),
        }
    }

    /// Decodes a stored payload. Unknown type names become `Extension`.
    pub fn from_parts(event_type: &str, data: Value) -> Result<Self, serde_json::Error> {
        let Some(known) = EventType::parse(event_type) else {
            return Ok(Self::Extension { event_type: event_type.to_owned(), data });
        };

        Ok(match known {
            EventType::SessionStart => Self::SessionStart(serde_json::from_value(data)?),
            EventType::NodeTransition => Self::NodeTransition(serde_json::from_value(data)?),
            EventType::ToolCall => Self::ToolCall(serde_json::from_value(data)?),
            EventType::ToolCallAttempt => Self::ToolCallAttempt(serde_json::from_value(data)?),
            EventType::ToolCallResult => Self::ToolCallResult(serde_json::from_value(data)?),
            EventType::EnforcementDecision => {
                Self::EnforcementDecision(serde_json::from_value(data)?)
            }
            EventType::RuntimeError => Self::RuntimeError(serde_json::from_value(data)?),
            EventType::SessionEnd => Self::SessionEnd(serde_json::from_value(data)?),
            EventType::ThreatClassification => {
                Self::ThreatClassification(serde_json::from_value(data)?)
            }
        })
    }
}

fn require_text(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::InvariantViolation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_attempt(field: &str, attempt: u32) -> Result<(), DomainError> {
    if attempt == 0 {
        return Err(DomainError::InvariantViolation(format!("{field} starts at 1")));
    }
    Ok(())
}

/// JSON kind name of a tool result, recorded as `output_type`.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// An event about to be appended. The timestamp is assigned by the log.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// A persisted, immutable event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn known_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    pub fn typed_payload(&self) -> Result<EventPayload, serde_json::Error> {
        EventPayload::from_parts(&self.event_type, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{
        json_kind, EnforcementDecisionPayload, EventPayload, EventType, ThreatClassificationPayload,
        ToolCallResultPayload, ToolCallStatus,
    };
    use crate::domain::classification::{AnalysisWindow, Classification, Intent, RiskLevel};
    use crate::domain::event::Decision;

    #[test]
    fn event_type_parse_accepts_only_closed_names() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse(" TOOL_CALL "), Some(EventType::ToolCall));
        assert_eq!(EventType::parse("tool_invoked"), None);
    }

    #[test]
    fn extension_cannot_shadow_builtin_type() {
        let payload =
            EventPayload::Extension { event_type: "session_end".to_owned(), data: json!({}) };
        assert!(payload.validate().is_err());

        let payload =
            EventPayload::Extension { event_type: "memory_write".to_owned(), data: json!({}) };
        assert!(payload.validate().is_ok());
        assert_eq!(payload.event_type_name(), "memory_write");
        assert_eq!(payload.known_type(), None);
    }

    #[test]
    fn unknown_type_decodes_as_extension() {
        let decoded = EventPayload::from_parts("memory_write", json!({"key": "k"}))
            .expect("extension decode");

        assert_eq!(
            decoded,
            EventPayload::Extension { event_type: "memory_write".to_owned(), data: json!({"key": "k"}) }
        );
    }

    #[test]
    fn tool_call_result_defaults_attempt_to_one() {
        let decoded = EventPayload::from_parts(
            "tool_call_result",
            json!({"tool": "Weather API", "status": "success"}),
        )
        .expect("decode");

        let EventPayload::ToolCallResult(ToolCallResultPayload { attempt, status, .. }) = decoded
        else {
            panic!("expected tool_call_result payload");
        };
        assert_eq!(attempt, 1);
        assert_eq!(status, ToolCallStatus::Success);
    }

    #[test]
    fn enforcement_decision_requires_reason() {
        let payload = EventPayload::EnforcementDecision(EnforcementDecisionPayload {
            tool_name: "lookup".to_owned(),
            tool_id: Some(5),
            decision: Decision::Block,
            reason: " ".to_owned(),
            policy_id: None,
        });

        assert!(payload.validate().is_err());
    }

    #[test]
    fn classification_payload_flattens_verdict_fields() {
        let now = Utc::now();
        let payload = EventPayload::ThreatClassification(ThreatClassificationPayload {
            classification: Classification::new(RiskLevel::Low, Intent::Benign, 0.2, "routine")
                .expect("valid"),
            analysis_window: AnalysisWindow { start: now - Duration::minutes(5), end: now },
            classification_timestamp: now,
        });

        payload.validate().expect("valid payload");
        let value = payload.to_value().expect("encode");
        assert_eq!(value["risk_level"], "low");
        assert_eq!(value["intent"], "benign");
        assert!(value["analysis_window"]["start"].is_string());
    }

    #[test]
    fn classification_payload_rejects_inverted_window() {
        let now = Utc::now();
        let payload = EventPayload::ThreatClassification(ThreatClassificationPayload {
            classification: Classification {
                risk_level: RiskLevel::Low,
                intent: Intent::Benign,
                confidence: 0.2,
                explanation: "routine".to_owned(),
            },
            analysis_window: AnalysisWindow { start: now, end: now - Duration::minutes(1) },
            classification_timestamp: now,
        });

        assert!(payload.validate().is_err());
    }

    #[test]
    fn json_kind_names_every_variant() {
        assert_eq!(json_kind(&json!({"a": 1})), "object");
        assert_eq!(json_kind(&json!([1])), "array");
        assert_eq!(json_kind(&json!("x")), "string");
        assert_eq!(json_kind(&json!(1.5)), "number");
        assert_eq!(json_kind(&json!(true)), "boolean");
        assert_eq!(json_kind(&json!(null)), "null");
    }
}
