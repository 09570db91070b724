use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sensitivity::{SensitivityFlag, ToolCategory};
use crate::domain::classification::AnalysisWindow;
use crate::domain::session::AgentId;

/// Label used in place of a session id for agent-wide summaries.
pub const AGENT_WIDE_SCOPE: &str = "agent_wide";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub tool_id: Option<i64>,
    pub params_provided: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementAttempt {
    pub tool: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Derived behavioral digest of one session or one agent's recent activity.
/// Rebuilt on every aggregation and never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionSummary {
    pub scope: String,
    pub agent_id: AgentId,
    pub window: AnalysisWindow,
    pub execution_count: u64,
    pub total_duration_seconds: f64,
    pub tool_names_used: BTreeSet<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_categories: BTreeMap<String, ToolCategory>,
    pub enforcement_decisions: BTreeMap<String, u64>,
    pub blocked_attempts: Vec<EnforcementAttempt>,
    pub paused_attempts: Vec<EnforcementAttempt>,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_types: BTreeMap<String, u64>,
    pub sensitivity_flags: BTreeSet<SensitivityFlag>,
    pub output_types: BTreeSet<String>,
    pub retry_count: u64,
}

impl ExecutionSummary {
    pub fn empty(scope: impl Into<String>, agent_id: AgentId, window: AnalysisWindow) -> Self {
        Self {
            scope: scope.into(),
            agent_id,
            window,
            execution_count: 0,
            total_duration_seconds: 0.0,
            tool_names_used: BTreeSet::new(),
            tool_calls: Vec::new(),
            tool_categories: BTreeMap::new(),
            enforcement_decisions: BTreeMap::new(),
            blocked_attempts: Vec::new(),
            paused_attempts: Vec::new(),
            success_count: 0,
            failure_count: 0,
            error_types: BTreeMap::new(),
            sensitivity_flags: BTreeSet::new(),
            output_types: BTreeSet::new(),
            retry_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = (self.success_count + self.failure_count).max(1);
        self.success_count as f64 / attempts as f64
    }

    /// Projection sent to the classifier. Field names are part of the wire contract.
    pub fn to_classification_context(&self) -> ClassificationContext {
        let blocked_tool_names: BTreeSet<&str> =
            self.blocked_attempts.iter().map(|attempt| attempt.tool.as_str()).collect();

        ClassificationContext {
            execution_metadata: ExecutionMetadata {
                session_id: self.scope.clone(),
                agent_id: self.agent_id.0,
                analysis_window: self.window,
                execution_count: self.execution_count,
                total_duration_seconds: self.total_duration_seconds,
            },
            tool_context: ToolContext {
                tools_used: self.tool_names_used.iter().cloned().collect(),
                tool_categories: self.tool_categories.clone(),
                total_tool_invocations: self.tool_calls.len() as u64,
            },
            behavioral_context: BehavioralContext {
                enforcement_decisions: self.enforcement_decisions.clone(),
                blocked_attempts_count: self.blocked_attempts.len() as u64,
                paused_attempts_count: self.paused_attempts.len() as u64,
                blocked_tool_names: blocked_tool_names.into_iter().map(str::to_owned).collect(),
            },
            outcome_context: OutcomeContext {
                success_rate: self.success_rate(),
                total_successes: self.success_count,
                total_failures: self.failure_count,
                error_types: self.error_types.clone(),
            },
            sensitivity_context: SensitivityContext {
                input_sensitivity_flags: self.sensitivity_flags.iter().copied().collect(),
                output_types_observed: self.output_types.iter().cloned().collect(),
                retry_patterns_detected: self.retry_count > 0,
                retry_count: self.retry_count,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationContext {
    pub execution_metadata: ExecutionMetadata,
    pub tool_context: ToolContext,
    pub behavioral_context: BehavioralContext,
    pub outcome_context: OutcomeContext,
    pub sensitivity_context: SensitivityContext,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub session_id: String,
    pub agent_id: i64,
    pub analysis_window: AnalysisWindow,
    pub execution_count: u64,
    pub total_duration_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub tools_used: Vec<String>,
    pub tool_categories: BTreeMap<String, ToolCategory>,
    pub total_tool_invocations: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehavioralContext {
    pub enforcement_decisions: BTreeMap<String, u64>,
    pub blocked_attempts_count: u64,
    pub paused_attempts_count: u64,
    pub blocked_tool_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeContext {
    pub success_rate: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub error_types: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityContext {
    pub input_sensitivity_flags: Vec<SensitivityFlag>,
    pub output_types_observed: Vec<String>,
    pub retry_patterns_detected: bool,
    pub retry_count: u64,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{EnforcementAttempt, ExecutionSummary};
    use crate::analysis::sensitivity::SensitivityFlag;
    use crate::domain::classification::AnalysisWindow;
    use crate::domain::session::AgentId;

    #[test]
    fn context_uses_wire_field_names() {
        let now = Utc::now();
        let mut summary =
            ExecutionSummary::empty("s-1", AgentId(9), AnalysisWindow { start: now, end: now });
        summary.success_count = 3;
        summary.failure_count = 1;
        summary.retry_count = 2;
        summary.sensitivity_flags.insert(SensitivityFlag::NetworkTargetPossible);
        for tool in ["shell", "shell", "fetch"] {
            summary.blocked_attempts.push(EnforcementAttempt {
                tool: tool.to_owned(),
                reason: "not allowed".to_owned(),
                timestamp: now,
            });
        }

        let value = serde_json::to_value(summary.to_classification_context()).expect("encode");

        assert_eq!(value["execution_metadata"]["session_id"], "s-1");
        assert_eq!(value["execution_metadata"]["agent_id"], 9);
        assert_eq!(value["outcome_context"]["success_rate"], 0.75);
        assert_eq!(value["behavioral_context"]["blocked_attempts_count"], 3);
        assert_eq!(
            value["behavioral_context"]["blocked_tool_names"],
            serde_json::json!(["fetch", "shell"])
        );
        assert_eq!(
            value["sensitivity_context"]["input_sensitivity_flags"],
            serde_json::json!(["network_target_possible"])
        );
        assert_eq!(value["sensitivity_context"]["retry_patterns_detected"], true);
        assert_eq!(value["tool_context"]["total_tool_invocations"], 0);
    }

    #[test]
    fn success_rate_of_empty_summary_is_zero() {
        let now = Utc::now();
        let summary =
            ExecutionSummary::empty("s", AgentId(1), AnalysisWindow { start: now, end: now });

        assert_eq!(summary.success_rate(), 0.0);
    }
}
