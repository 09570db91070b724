use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use warden_core::{Decision, EventLogError, ToolDefinition};

use crate::interception::InterceptionHook;

/// Executes a tool body once the policy gate has allowed it.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &ToolDefinition, params: &Value) -> Result<Value>;
}

/// Deterministic executor that echoes the tool name and params.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubToolExecutor;

#[async_trait]
impl ToolExecutor for StubToolExecutor {
    async fn execute(&self, tool: &ToolDefinition, params: &Value) -> Result<Value> {
        Ok(json!({
            "status": "stub_execution",
            "message": format!(
                "Tool '{}' would execute with params: {}",
                tool.name,
                serde_json::to_string(params)?
            ),
        }))
    }
}

#[derive(Debug, Error)]
pub enum ToolInvocationError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Invalid parameters for tool: {0}")]
    InvalidParameters(String),
    #[error("interception failed: {0}")]
    Interception(#[from] EventLogError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Blocked(String),
    Paused(String),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Human-readable error text for every non-success outcome.
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            ToolOutcome::Success(_) => None,
            ToolOutcome::Blocked(reason) => Some(format!("Tool execution blocked: {reason}")),
            ToolOutcome::Paused(reason) => Some(format!("Tool execution paused: {reason}")),
            ToolOutcome::Failed(error) => Some(error.clone()),
        }
    }

    /// The envelope handed back to the model as a tool message.
    pub fn to_message_content(&self) -> String {
        let mut envelope = json!({
            "success": self.is_success(),
            "tool": self.tool,
            "duration_ms": self.duration_ms,
        });
        if let Some(result) = self.result() {
            envelope["result"] = result.clone();
        }
        if let Some(error) = self.error() {
            envelope["error"] = Value::String(error);
        }
        envelope.to_string()
    }
}

/// Validates and runs one tool call behind an interception hook.
#[derive(Clone)]
pub struct ToolInvoker {
    tools: HashMap<String, ToolDefinition>,
    executor: Arc<dyn ToolExecutor>,
}

impl ToolInvoker {
    pub fn new(tools: impl IntoIterator<Item = ToolDefinition>, executor: Arc<dyn ToolExecutor>) -> Self {
        let tools = tools.into_iter().map(|tool| (tool.name.clone(), tool)).collect();
        Self { tools, executor }
    }

    pub fn with_stub(tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        Self::new(tools, Arc::new(StubToolExecutor))
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Shallow check: every `required` field of the input schema is present.
    /// Types and nested schemas are not validated.
    pub fn validate_params(&self, tool_name: &str, params: &Value) -> bool {
        let Some(tool) = self.tool(tool_name) else {
            return false;
        };
        let required = tool.required_fields();
        if required.is_empty() {
            return true;
        }
        match params.as_object() {
            Some(object) => required.iter().all(|field| object.contains_key(*field)),
            None => false,
        }
    }

    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        params: &Value,
        hook: &dyn InterceptionHook,
    ) -> Result<ToolInvocation, ToolInvocationError> {
        let tool = self
            .tool(tool_name)
            .ok_or_else(|| ToolInvocationError::ToolNotFound(tool_name.to_string()))?;
        if !self.validate_params(tool_name, params) {
            return Err(ToolInvocationError::InvalidParameters(tool_name.to_string()));
        }

        let started = Instant::now();
        let interception = hook.intercept(tool_name, Some(tool.id), params).await?;
        let outcome = match interception.decision {
            Decision::Block => ToolOutcome::Blocked(interception.reason),
            Decision::Pause => ToolOutcome::Paused(interception.reason),
            Decision::Allow => match self.executor.execute(tool, params).await {
                Ok(value) => ToolOutcome::Success(value),
                Err(error) => ToolOutcome::Failed(error.to_string()),
            },
        };

        Ok(ToolInvocation { tool: tool_name.to_string(), outcome, duration_ms: elapsed_ms(started) })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use warden_core::{Decision, EventLogError, ToolDefinition, ToolId};

    use super::{ToolExecutor, ToolInvocationError, ToolInvoker, ToolOutcome};
    use crate::interception::{InterceptionHook, InterceptionResult};

    struct FixedHook {
        decision: Decision,
        calls: AtomicUsize,
    }

    impl FixedHook {
        fn new(decision: Decision) -> Self {
            Self { decision, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl InterceptionHook for FixedHook {
        async fn intercept(
            &self,
            tool_name: &str,
            _tool_id: Option<ToolId>,
            _params: &Value,
        ) -> Result<InterceptionResult, EventLogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(InterceptionResult {
                decision: self.decision,
                reason: format!("fixed decision for {tool_name}"),
                policy_id: "fixed",
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl ToolExecutor for FailingExecutor {
        async fn execute(&self, _tool: &ToolDefinition, _params: &Value) -> anyhow::Result<Value> {
            Err(anyhow!("upstream timed out"))
        }
    }

    fn weather_tool() -> ToolDefinition {
        ToolDefinition {
            id: ToolId(1),
            name: "weather".to_string(),
            description: "Current weather".to_string(),
            input_schema: json!({"type": "object", "required": ["city"]}),
            output_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn validation_is_a_presence_check() {
        let invoker = ToolInvoker::with_stub([weather_tool()]);

        assert!(invoker.validate_params("weather", &json!({"city": 42})));
        assert!(!invoker.validate_params("weather", &json!({"town": "Oslo"})));
        assert!(!invoker.validate_params("weather", &json!("Oslo")));
        assert!(!invoker.validate_params("unknown", &json!({"city": "Oslo"})));
    }

    #[tokio::test]
    async fn allowed_call_runs_stub_executor() {
        let invoker = ToolInvoker::with_stub([weather_tool()]);
        let hook = FixedHook::new(Decision::Allow);

        let invocation = invoker
            .invoke_tool("weather", &json!({"city": "Oslo"}), &hook)
            .await
            .expect("invoke");

        assert!(invocation.is_success());
        let result = invocation.result().expect("result");
        assert_eq!(result["status"], "stub_execution");
        assert_eq!(
            result["message"],
            "Tool 'weather' would execute with params: {\"city\":\"Oslo\"}"
        );
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_params_fail_before_interception() {
        let invoker = ToolInvoker::with_stub([weather_tool()]);
        let hook = FixedHook::new(Decision::Allow);

        let missing = invoker.invoke_tool("radar", &json!({}), &hook).await.expect_err("not found");
        let invalid = invoker.invoke_tool("weather", &json!({}), &hook).await.expect_err("invalid");

        assert!(matches!(missing, ToolInvocationError::ToolNotFound(_)));
        assert_eq!(missing.to_string(), "Tool not found: radar");
        assert_eq!(invalid.to_string(), "Invalid parameters for tool: weather");
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blocked_and_paused_calls_never_execute() {
        let invoker = ToolInvoker::new([weather_tool()], Arc::new(FailingExecutor));

        let blocked = invoker
            .invoke_tool("weather", &json!({"city": "Oslo"}), &FixedHook::new(Decision::Block))
            .await
            .expect("blocked");
        let paused = invoker
            .invoke_tool("weather", &json!({"city": "Oslo"}), &FixedHook::new(Decision::Pause))
            .await
            .expect("paused");

        assert_eq!(blocked.outcome, ToolOutcome::Blocked("fixed decision for weather".to_string()));
        assert_eq!(
            blocked.error().as_deref(),
            Some("Tool execution blocked: fixed decision for weather")
        );
        assert!(matches!(paused.outcome, ToolOutcome::Paused(_)));
    }

    #[tokio::test]
    async fn executor_failure_becomes_failed_outcome() {
        let invoker = ToolInvoker::new([weather_tool()], Arc::new(FailingExecutor));
        let hook = FixedHook::new(Decision::Allow);

        let invocation = invoker
            .invoke_tool("weather", &json!({"city": "Oslo"}), &hook)
            .await
            .expect("failures are not raised");

        assert_eq!(invocation.outcome, ToolOutcome::Failed("upstream timed out".to_string()));
        let envelope: Value =
            serde_json::from_str(&invocation.to_message_content()).expect("json envelope");
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"], "upstream timed out");
    }
}
