use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use warden_core::domain::event::EnforcementDecisionPayload;
use warden_core::{
    AgentId, AgentPolicy, Decision, EventLog, EventLogError, EventPayload, SessionId, ToolId,
};

pub const RULE_ALLOWED_TOOLS: &str = "allowed_tools";
pub const RULE_FREQUENCY_LIMIT: &str = "frequency_limit";
pub const RULE_REQUIRE_APPROVAL: &str = "require_approval";
pub const RULE_DEFAULT_ALLOW: &str = "default_allow";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterceptionResult {
    pub decision: Decision,
    pub reason: String,
    pub policy_id: &'static str,
}

impl InterceptionResult {
    fn new(decision: Decision, reason: String, policy_id: &'static str) -> Self {
        Self { decision, reason, policy_id }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Pre-execution gate consulted by the tool invoker.
#[async_trait]
pub trait InterceptionHook: Send + Sync {
    async fn intercept(
        &self,
        tool_name: &str,
        tool_id: Option<ToolId>,
        params: &Value,
    ) -> Result<InterceptionResult, EventLogError>;
}

/// Per-run policy evaluator.
///
/// Rules are checked in a fixed order: allowed tools, frequency limit,
/// approval requirement. Only an `allow` increments the tool's counter, and
/// every decision is written to the event log.
pub struct InterceptionPolicy {
    log: EventLog,
    session_id: SessionId,
    agent_id: AgentId,
    allowed_tool_ids: BTreeSet<ToolId>,
    frequency_limit: Option<u32>,
    require_approval_for_all: bool,
    counters: Mutex<HashMap<String, u32>>,
}

impl InterceptionPolicy {
    pub fn new(log: EventLog, session_id: SessionId, agent_id: AgentId, policy: &AgentPolicy) -> Self {
        Self {
            log,
            session_id,
            agent_id,
            allowed_tool_ids: policy.allowed_tool_ids.iter().copied().collect(),
            frequency_limit: policy.frequency_limit.map(|limit| limit.get()),
            require_approval_for_all: policy.require_approval_for_all,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn invocation_count(&self, tool_name: &str) -> u32 {
        lock(&self.counters).get(tool_name).copied().unwrap_or(0)
    }

    fn evaluate(&self, tool_name: &str, tool_id: Option<ToolId>) -> InterceptionResult {
        if !self.allowed_tool_ids.is_empty()
            && !tool_id.is_some_and(|id| self.allowed_tool_ids.contains(&id))
        {
            let id = tool_id.map_or_else(|| "none".to_string(), |id| id.0.to_string());
            return InterceptionResult::new(
                Decision::Block,
                format!("Tool '{tool_name}' (ID: {id}) is not in the allowed tools list for this agent"),
                RULE_ALLOWED_TOOLS,
            );
        }

        if let Some(limit) = self.frequency_limit {
            let count = self.invocation_count(tool_name);
            if count >= limit {
                return InterceptionResult::new(
                    Decision::Block,
                    format!("Tool '{tool_name}' has reached frequency limit ({count}/{limit})"),
                    RULE_FREQUENCY_LIMIT,
                );
            }
        }

        if self.require_approval_for_all {
            return InterceptionResult::new(
                Decision::Pause,
                format!("Tool '{tool_name}' requires user approval before execution"),
                RULE_REQUIRE_APPROVAL,
            );
        }

        InterceptionResult::new(
            Decision::Allow,
            format!("Tool '{tool_name}' passed all policy checks"),
            RULE_DEFAULT_ALLOW,
        )
    }
}

#[async_trait]
impl InterceptionHook for InterceptionPolicy {
    async fn intercept(
        &self,
        tool_name: &str,
        tool_id: Option<ToolId>,
        _params: &Value,
    ) -> Result<InterceptionResult, EventLogError> {
        let result = self.evaluate(tool_name, tool_id);

        info!(
            event_name = "agent.interception.decided",
            session_id = %self.session_id,
            agent_id = self.agent_id.0,
            tool = tool_name,
            decision = result.decision.as_str(),
            policy_id = result.policy_id,
            "tool call intercepted"
        );

        self.log
            .emit(
                &self.session_id,
                self.agent_id,
                EventPayload::EnforcementDecision(EnforcementDecisionPayload {
                    tool_name: tool_name.to_string(),
                    tool_id: tool_id.map(|id| id.0),
                    decision: result.decision,
                    reason: result.reason.clone(),
                    policy_id: Some(result.policy_id.to_string()),
                }),
            )
            .await?;

        // Only a recorded allow counts toward the frequency limit.
        if result.decision == Decision::Allow {
            *lock(&self.counters).entry(tool_name.to_string()).or_insert(0) += 1;
        }

        Ok(result)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::sync::Arc;

    use serde_json::json;
    use warden_core::event_log::SortOrder;
    use warden_core::{
        AgentId, AgentPolicy, Decision, EventLog, EventType, InMemorySessionRepository, SessionId,
        ToolId,
    };

    use super::{InterceptionHook, InterceptionPolicy};
    use crate::test_support::RejectingStore;

    fn limit(value: u32) -> NonZeroU32 {
        NonZeroU32::new(value).expect("non-zero limit")
    }

    fn policy_for(log: &EventLog, policy: AgentPolicy) -> InterceptionPolicy {
        InterceptionPolicy::new(log.clone(), SessionId::from("s-1"), AgentId(1), &policy)
    }

    #[tokio::test]
    async fn frequency_limit_allows_then_blocks() {
        let log = EventLog::in_memory();
        let policy = policy_for(
            &log,
            AgentPolicy::unrestricted().allow_tools([ToolId(5)]).with_frequency_limit(limit(2)),
        );

        let first = policy.intercept("lookup", Some(ToolId(5)), &json!({})).await.expect("first");
        let second = policy.intercept("lookup", Some(ToolId(5)), &json!({})).await.expect("second");
        let third = policy.intercept("lookup", Some(ToolId(5)), &json!({})).await.expect("third");

        assert_eq!(first.decision, Decision::Allow);
        assert_eq!(second.decision, Decision::Allow);
        assert_eq!(third.decision, Decision::Block);
        assert!(third.reason.contains("2/2"), "reason was `{}`", third.reason);

        let other = policy.intercept("delete", Some(ToolId(9)), &json!({})).await.expect("other");
        assert_eq!(other.decision, Decision::Block);
        assert!(other.reason.contains("not in the allowed tools list"));
    }

    #[tokio::test]
    async fn approval_requirement_pauses_without_counting() {
        let log = EventLog::in_memory();
        let policy = policy_for(
            &log,
            AgentPolicy::unrestricted().allow_tools([ToolId(5)]).requiring_approval(),
        );

        let result = policy.intercept("lookup", Some(ToolId(5)), &json!({})).await.expect("intercept");

        assert_eq!(result.decision, Decision::Pause);
        assert_eq!(result.reason, "Tool 'lookup' requires user approval before execution");
        assert_eq!(policy.invocation_count("lookup"), 0);
    }

    #[tokio::test]
    async fn allow_list_is_checked_before_frequency() {
        let log = EventLog::in_memory();
        let policy = policy_for(
            &log,
            AgentPolicy::unrestricted().allow_tools([ToolId(1)]).with_frequency_limit(limit(1)),
        );

        let blocked = policy.intercept("search", Some(ToolId(2)), &json!({})).await.expect("intercept");

        assert_eq!(blocked.policy_id, super::RULE_ALLOWED_TOOLS);
        assert_eq!(
            blocked.reason,
            "Tool 'search' (ID: 2) is not in the allowed tools list for this agent"
        );
        assert_eq!(policy.invocation_count("search"), 0);
    }

    #[tokio::test]
    async fn unrestricted_policy_counts_each_allow() {
        let log = EventLog::in_memory();
        let policy = policy_for(&log, AgentPolicy::unrestricted());

        for _ in 0..3 {
            let result = policy.intercept("echo", None, &json!({})).await.expect("intercept");
            assert!(result.is_allowed());
        }

        assert_eq!(policy.invocation_count("echo"), 3);
    }

    #[tokio::test]
    async fn every_decision_is_recorded() {
        let log = EventLog::in_memory();
        let policy = policy_for(&log, AgentPolicy::unrestricted().with_frequency_limit(limit(1)));

        policy.intercept("echo", Some(ToolId(3)), &json!({})).await.expect("allow");
        policy.intercept("echo", Some(ToolId(3)), &json!({})).await.expect("block");

        let events = log
            .get_session_logs(&SessionId::from("s-1"), SortOrder::Ascending)
            .await
            .expect("read events");
        let decisions: Vec<&str> = events
            .iter()
            .filter(|event| event.event_type == "enforcement_decision")
            .filter_map(|event| event.payload["decision"].as_str())
            .collect();

        assert_eq!(decisions, vec!["allow", "block"]);
        assert_eq!(events[1].payload["policy_id"], "frequency_limit");
        assert_eq!(events[0].payload["tool_id"], 3);
    }

    #[tokio::test]
    async fn unrecorded_allow_does_not_count() {
        let log = EventLog::new(
            Arc::new(RejectingStore::new(EventType::EnforcementDecision)),
            Arc::new(InMemorySessionRepository::default()),
        );
        let policy = policy_for(&log, AgentPolicy::unrestricted().with_frequency_limit(limit(1)));

        let result = policy.intercept("echo", Some(ToolId(3)), &json!({})).await;

        assert!(result.is_err());
        assert_eq!(policy.invocation_count("echo"), 0);
    }
}
