use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::AgentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolId(pub i64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl ToolDefinition {
    /// Field names listed under the input schema's `required` key.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Rules an agent's tool calls must satisfy.
///
/// An empty `allowed_tool_ids` list means every tool is allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub allowed_tool_ids: Vec<ToolId>,
    pub frequency_limit: Option<NonZeroU32>,
    pub require_approval_for_all: bool,
}

impl AgentPolicy {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn allow_tools(mut self, ids: impl IntoIterator<Item = ToolId>) -> Self {
        self.allowed_tool_ids = ids.into_iter().collect();
        self
    }

    pub fn with_frequency_limit(mut self, limit: NonZeroU32) -> Self {
        self.frequency_limit = Some(limit);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.require_approval_for_all = true;
        self
    }
}

/// Read-only snapshot of an agent, treated as immutable for a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    pub purpose: String,
    pub description: String,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub policy: AgentPolicy,
}

impl AgentDefinition {
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}
