use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_core::domain::event::{
    json_kind, NodeTransitionPayload, RuntimeErrorPayload, SessionEndPayload, SessionStartPayload,
    ToolCallPayload, ToolCallResultPayload,
};
use warden_core::{
    AgentDefinition, AgentId, DomainError, EventLog, EventLogError, EventPayload,
    RuntimeErrorKind, Session, SessionId, SessionStatus, ToolCallStatus,
};

use crate::interception::InterceptionPolicy;
use crate::llm::{ChatMessage, ChatModel, Role, ToolCallRequest};
use crate::tools::{ToolExecutor, ToolInvocation, ToolInvocationError, ToolInvoker, ToolOutcome};

/// States of one agent run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeNode {
    Reason,
    Decide,
    InvokeTool,
    Completed,
    Failed,
    Terminated,
    Paused,
}

impl RuntimeNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reason => "reason",
            Self::Decide => "decide_action",
            Self::InvokeTool => "invoke_tool",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Paused => "paused",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub final_output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("event log unavailable: {0}")]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Engine-owned state for a single `execute` call, updated in place.
struct RuntimeContext {
    session_id: SessionId,
    agent_id: AgentId,
    messages: Vec<ChatMessage>,
    pending_tool_call: Option<ToolCallRequest>,
    status: SessionStatus,
    final_output: Option<String>,
    error: Option<String>,
}

impl RuntimeContext {
    fn new(session_id: SessionId, agent_id: AgentId, system_prompt: &str, user_input: &str) -> Self {
        Self {
            session_id,
            agent_id,
            messages: vec![ChatMessage::system(system_prompt), ChatMessage::user(user_input)],
            pending_tool_call: None,
            status: SessionStatus::Running,
            final_output: None,
            error: None,
        }
    }
}

pub struct RuntimeEngine {
    agent: Arc<AgentDefinition>,
    chat: Arc<dyn ChatModel>,
    invoker: ToolInvoker,
    log: EventLog,
    system_prompt: String,
}

impl RuntimeEngine {
    pub fn new(agent: AgentDefinition, chat: Arc<dyn ChatModel>, log: EventLog) -> Self {
        let invoker = ToolInvoker::with_stub(agent.tools.iter().cloned());
        let system_prompt = build_system_prompt(&agent);
        Self { agent: Arc::new(agent), chat, invoker, log, system_prompt }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.invoker = ToolInvoker::new(self.agent.tools.iter().cloned(), executor);
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Runs the agent once against `user_input`.
    ///
    /// Failures inside the state machine end the session as `failed`. Only a
    /// failed `session_start` or `session_end` emit is returned as an error.
    pub async fn execute(&self, user_input: &str) -> Result<ExecutionResult, RuntimeError> {
        let session_id = SessionId::generate();
        let agent_id = self.agent.id;
        let mut session = Session::start(session_id.clone(), agent_id, user_input);

        self.log.save_session(&session).await?;
        self.log
            .emit(
                &session_id,
                agent_id,
                EventPayload::SessionStart(SessionStartPayload { user_input: user_input.to_string() }),
            )
            .await?;
        info!(
            event_name = "agent.session.started",
            session_id = %session_id,
            agent_id = agent_id.0,
            agent = %self.agent.name,
            "agent session started"
        );

        // The frequency counter lives exactly as long as this run.
        let policy =
            InterceptionPolicy::new(self.log.clone(), session_id.clone(), agent_id, &self.agent.policy);
        let mut ctx = RuntimeContext::new(session_id.clone(), agent_id, &self.system_prompt, user_input);

        if let Err(error) = self.drive(&mut ctx, &policy).await {
            warn!(
                event_name = "agent.session.internal_error",
                session_id = %session_id,
                agent_id = agent_id.0,
                error = %error,
                "agent run aborted"
            );
            ctx.status = SessionStatus::Failed;
            ctx.final_output = None;
            ctx.error = Some(error.to_string());
            self.record_runtime_error(&ctx, RuntimeErrorKind::InternalError, &error.to_string()).await;
        }

        // session_end is what marks the run finished for the classifier.
        self.log
            .emit(
                &session_id,
                agent_id,
                EventPayload::SessionEnd(SessionEndPayload {
                    status: ctx.status,
                    final_output: ctx.final_output.clone(),
                    error: ctx.error.clone(),
                }),
            )
            .await?;
        if let Err(error) = self.close_session(&mut session, ctx.status).await {
            warn!(
                event_name = "agent.session.save_failed",
                session_id = %session_id,
                agent_id = agent_id.0,
                error = %error,
                "final session record was not saved"
            );
        }
        info!(
            event_name = "agent.session.finished",
            session_id = %session_id,
            agent_id = agent_id.0,
            status = ctx.status.as_str(),
            "agent session finished"
        );

        Ok(ExecutionResult {
            session_id,
            status: ctx.status,
            final_output: ctx.final_output,
            error: ctx.error,
        })
    }

    async fn close_session(
        &self,
        session: &mut Session,
        status: SessionStatus,
    ) -> Result<(), RuntimeError> {
        session.transition_to(status)?;
        self.log.save_session(session).await?;
        Ok(())
    }

    async fn drive(
        &self,
        ctx: &mut RuntimeContext,
        policy: &InterceptionPolicy,
    ) -> Result<(), EventLogError> {
        let mut previous: Option<RuntimeNode> = None;
        let mut node = RuntimeNode::Reason;

        loop {
            self.enter(ctx, previous, node).await?;
            let next = match node {
                RuntimeNode::Reason => self.reason(ctx).await?,
                RuntimeNode::Decide => self.decide(ctx).await?,
                RuntimeNode::InvokeTool => self.invoke_tool(ctx, policy).await?,
                RuntimeNode::Completed
                | RuntimeNode::Failed
                | RuntimeNode::Terminated
                | RuntimeNode::Paused => return Ok(()),
            };
            previous = Some(node);
            node = next;
        }
    }

    async fn enter(
        &self,
        ctx: &RuntimeContext,
        from: Option<RuntimeNode>,
        to: RuntimeNode,
    ) -> Result<(), EventLogError> {
        debug!(
            event_name = "agent.node.entered",
            session_id = %ctx.session_id,
            from = from.map(|node| node.as_str()).unwrap_or("start"),
            to = to.as_str(),
            "runtime node entered"
        );
        self.log
            .emit(
                &ctx.session_id,
                ctx.agent_id,
                EventPayload::NodeTransition(NodeTransitionPayload {
                    from: from.map(|node| node.as_str().to_string()),
                    to: to.as_str().to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn reason(&self, ctx: &mut RuntimeContext) -> Result<RuntimeNode, EventLogError> {
        match self.chat.invoke(&ctx.messages).await {
            Ok(response) => {
                ctx.messages.push(response);
                Ok(RuntimeNode::Decide)
            }
            Err(error) => {
                self.fail(ctx, RuntimeErrorKind::ReasoningError, format!("Reasoning error: {error}"))
                    .await
            }
        }
    }

    async fn decide(&self, ctx: &mut RuntimeContext) -> Result<RuntimeNode, EventLogError> {
        let Some(last) = ctx.messages.last() else {
            return self.fail(ctx, RuntimeErrorKind::NoMessages, "No messages".to_string()).await;
        };

        if let Some(call) = &last.tool_call {
            ctx.pending_tool_call = Some(call.clone());
            return Ok(RuntimeNode::InvokeTool);
        }

        let output = if last.role == Role::Assistant {
            last.content.clone()
        } else {
            "No response".to_string()
        };
        ctx.status = SessionStatus::Completed;
        ctx.final_output = Some(output);
        Ok(RuntimeNode::Completed)
    }

    async fn invoke_tool(
        &self,
        ctx: &mut RuntimeContext,
        policy: &InterceptionPolicy,
    ) -> Result<RuntimeNode, EventLogError> {
        let Some(call) = ctx.pending_tool_call.take() else {
            return self
                .fail(ctx, RuntimeErrorKind::InternalError, "No pending tool call".to_string())
                .await;
        };

        self.log
            .emit(
                &ctx.session_id,
                ctx.agent_id,
                EventPayload::ToolCall(ToolCallPayload {
                    tool: call.name.clone(),
                    tool_id: self.agent.tool(&call.name).map(|tool| tool.id.0),
                    call_id: Some(call.call_id.clone()),
                    params: call.arguments.clone(),
                }),
            )
            .await?;

        let invocation = match self.invoker.invoke_tool(&call.name, &call.arguments, policy).await {
            Ok(invocation) => invocation,
            Err(ToolInvocationError::Interception(error)) => return Err(error),
            Err(error @ ToolInvocationError::ToolNotFound(_)) => {
                return self.fail(ctx, RuntimeErrorKind::ToolNotFound, error.to_string()).await;
            }
            Err(error @ ToolInvocationError::InvalidParameters(_)) => {
                return self.fail(ctx, RuntimeErrorKind::InvalidParameters, error.to_string()).await;
            }
        };

        self.record_result(ctx, &invocation).await?;

        match &invocation.outcome {
            ToolOutcome::Success(_) => {
                ctx.messages
                    .push(ChatMessage::tool_result(call.call_id, invocation.to_message_content()));
                Ok(RuntimeNode::Reason)
            }
            ToolOutcome::Blocked(_) => {
                ctx.status = SessionStatus::Terminated;
                ctx.error = invocation.error();
                Ok(RuntimeNode::Terminated)
            }
            ToolOutcome::Paused(_) => {
                ctx.status = SessionStatus::Paused;
                ctx.error = invocation.error();
                Ok(RuntimeNode::Paused)
            }
            ToolOutcome::Failed(error) => {
                self.fail(ctx, RuntimeErrorKind::ToolExecutionError, error.clone()).await
            }
        }
    }

    async fn record_result(
        &self,
        ctx: &RuntimeContext,
        invocation: &ToolInvocation,
    ) -> Result<(), EventLogError> {
        let status = match invocation.outcome {
            ToolOutcome::Success(_) => ToolCallStatus::Success,
            ToolOutcome::Blocked(_) => ToolCallStatus::Blocked,
            ToolOutcome::Paused(_) => ToolCallStatus::Paused,
            ToolOutcome::Failed(_) => ToolCallStatus::Error,
        };
        self.log
            .emit(
                &ctx.session_id,
                ctx.agent_id,
                EventPayload::ToolCallResult(ToolCallResultPayload {
                    tool: invocation.tool.clone(),
                    status,
                    output_type: invocation.result().map(|value| json_kind(value).to_string()),
                    attempt: 1,
                    duration_ms: invocation.duration_ms,
                    result: invocation.result().cloned(),
                    error: invocation.error(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &mut RuntimeContext,
        kind: RuntimeErrorKind,
        message: String,
    ) -> Result<RuntimeNode, EventLogError> {
        self.log
            .emit(
                &ctx.session_id,
                ctx.agent_id,
                EventPayload::RuntimeError(RuntimeErrorPayload {
                    error_type: kind,
                    message: message.clone(),
                    stack_trace: None,
                }),
            )
            .await?;
        ctx.status = SessionStatus::Failed;
        ctx.error = Some(message);
        Ok(RuntimeNode::Failed)
    }

    async fn record_runtime_error(&self, ctx: &RuntimeContext, kind: RuntimeErrorKind, message: &str) {
        let payload = EventPayload::RuntimeError(RuntimeErrorPayload {
            error_type: kind,
            message: message.to_string(),
            stack_trace: None,
        });
        if let Err(error) = self.log.emit(&ctx.session_id, ctx.agent_id, payload).await {
            warn!(
                event_name = "agent.runtime_error.unrecorded",
                session_id = %ctx.session_id,
                error = %error,
                "failed to record runtime error"
            );
        }
    }
}

fn build_system_prompt(agent: &AgentDefinition) -> String {
    let mut lines = vec![
        format!("You are {}.", agent.name),
        format!("Purpose: {}", agent.purpose),
        format!("Description: {}", agent.description),
        String::new(),
        "Available tools:".to_string(),
    ];
    lines.extend(agent.tools.iter().map(|tool| format!("- {}: {}", tool.name, tool.description)));
    lines.extend([
        String::new(),
        "Follow these rules:".to_string(),
        "- Use tools when needed to answer questions".to_string(),
        "- Provide clear, concise answers".to_string(),
        "- If you cannot answer, explain why".to_string(),
    ]);
    lines.join("\n")
}
