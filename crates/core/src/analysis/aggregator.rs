use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use thiserror::Error;
use tracing::warn;

use super::sensitivity::{params_provided, KeywordSensitivityClassifier, SensitivityClassifier};
use super::summary::{EnforcementAttempt, ExecutionSummary, ToolCallRecord, AGENT_WIDE_SCOPE};
use crate::domain::classification::AnalysisWindow;
use crate::domain::event::{Decision, EventPayload, EventRecord, ToolCallStatus};
use crate::domain::session::{AgentId, SessionId};
use crate::event_log::{EventLog, EventLogError, SortOrder};

pub const DEFAULT_AGENT_WINDOW_HOURS: i64 = 24;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("could not read events: {0}")]
    EventLog(#[from] EventLogError),
    #[error("invalid aggregation window of {0} hours")]
    InvalidWindow(i64),
}

/// Builds execution summaries from raw, unredacted events.
#[derive(Clone)]
pub struct LogAggregator {
    log: EventLog,
    sensitivity: Arc<dyn SensitivityClassifier>,
}

impl LogAggregator {
    pub fn new(log: EventLog) -> Self {
        Self::with_classifier(log, Arc::new(KeywordSensitivityClassifier))
    }

    pub fn with_classifier(log: EventLog, sensitivity: Arc<dyn SensitivityClassifier>) -> Self {
        Self { log, sensitivity }
    }

    pub async fn aggregate_session(
        &self,
        session_id: &SessionId,
        agent_id: AgentId,
    ) -> Result<ExecutionSummary, AggregationError> {
        let events = match self.log.session_events(session_id, SortOrder::Ascending).await {
            Ok(events) => events,
            Err(EventLogError::SessionNotFound(_)) => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        let now = Utc::now().trunc_subsecs(6);
        let window = AnalysisWindow {
            start: events.iter().map(|event| event.timestamp).min().unwrap_or(now),
            end: events.iter().map(|event| event.timestamp).max().unwrap_or(now),
        };

        let mut summary = ExecutionSummary::empty(session_id.as_str(), agent_id, window);
        self.fold(&mut summary, &events);
        Ok(summary)
    }

    /// Same pass as [`Self::aggregate_session`] over every event the agent
    /// recorded in the trailing `window_hours`.
    pub async fn aggregate_agent_recent(
        &self,
        agent_id: AgentId,
        window_hours: i64,
    ) -> Result<ExecutionSummary, AggregationError> {
        let span = Duration::try_hours(window_hours)
            .filter(|span| *span > Duration::zero())
            .ok_or(AggregationError::InvalidWindow(window_hours))?;
        let end = Utc::now().trunc_subsecs(6);
        let start = end - span;

        let events = self.log.agent_events(agent_id, Some(start), Some(end)).await?;
        let mut summary =
            ExecutionSummary::empty(AGENT_WIDE_SCOPE, agent_id, AnalysisWindow { start, end });
        self.fold(&mut summary, &events);
        Ok(summary)
    }

    fn fold(&self, summary: &mut ExecutionSummary, events: &[EventRecord]) {
        let mut open_runs: HashMap<&SessionId, DateTime<Utc>> = HashMap::new();

        for event in events {
            let payload = match event.typed_payload() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(
                        event_name = "analysis.payload_skipped",
                        session_id = %event.session_id,
                        event_id = event.id,
                        event_type = %event.event_type,
                        error = %error,
                        "skipping undecodable event payload"
                    );
                    continue;
                }
            };

            match payload {
                EventPayload::SessionStart(_) => {
                    summary.execution_count += 1;
                    open_runs.insert(&event.session_id, event.timestamp);
                }
                EventPayload::SessionEnd(_) => {
                    if let Some(started) = open_runs.remove(&event.session_id) {
                        let elapsed = event.timestamp - started;
                        summary.total_duration_seconds +=
                            elapsed.num_microseconds().unwrap_or_default() as f64 / 1_000_000.0;
                    }
                }
                EventPayload::ToolCall(call) => {
                    summary.tool_names_used.insert(call.tool.clone());
                    summary.sensitivity_flags.extend(self.sensitivity.flags(&call.tool, Some(&call.params)));
                    summary.tool_calls.push(ToolCallRecord {
                        tool: call.tool,
                        tool_id: call.tool_id,
                        params_provided: params_provided(Some(&call.params)),
                        timestamp: event.timestamp,
                    });
                }
                EventPayload::ToolCallResult(result) => {
                    if result.status == ToolCallStatus::Success {
                        summary.success_count += 1;
                    } else {
                        summary.failure_count += 1;
                    }
                    if let Some(output_type) = result.output_type.filter(|kind| kind != "unknown") {
                        summary.output_types.insert(output_type);
                    }
                    if result.attempt > 1 {
                        summary.retry_count += 1;
                    }
                }
                EventPayload::EnforcementDecision(decision) => {
                    *summary
                        .enforcement_decisions
                        .entry(decision.decision.as_str().to_owned())
                        .or_insert(0) += 1;
                    let attempt = EnforcementAttempt {
                        tool: decision.tool_name,
                        reason: decision.reason,
                        timestamp: event.timestamp,
                    };
                    match decision.decision {
                        Decision::Block => summary.blocked_attempts.push(attempt),
                        Decision::Pause => summary.paused_attempts.push(attempt),
                        Decision::Allow => {}
                    }
                }
                EventPayload::RuntimeError(error) => {
                    *summary.error_types.entry(error.error_type.as_str().to_owned()).or_insert(0) +=
                        1;
                    summary.failure_count += 1;
                }
                EventPayload::NodeTransition(_)
                | EventPayload::ToolCallAttempt(_)
                | EventPayload::ThreatClassification(_)
                | EventPayload::Extension { .. } => {}
            }
        }

        for tool in &summary.tool_names_used {
            summary.tool_categories.insert(tool.clone(), self.sensitivity.category(tool));
        }
    }
}
