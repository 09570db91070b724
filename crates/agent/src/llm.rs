use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    pub call_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_call: None, tool_call_id: None }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_request(call: ToolCallRequest) -> Self {
        Self { tool_call: Some(call), ..Self::plain(Role::Assistant, "") }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: Some(call_id.into()), ..Self::plain(Role::Tool, content) }
    }
}

/// Opaque chat capability: full history in, one response message out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatMessage, Role, ToolCallRequest};

    #[test]
    fn tool_request_is_an_assistant_message() {
        let message = ChatMessage::tool_request(ToolCallRequest {
            name: "lookup".to_string(),
            arguments: json!({"q": "rust"}),
            call_id: "call-1".to_string(),
        });

        assert_eq!(message.role, Role::Assistant);
        assert!(message.content.is_empty());
        assert_eq!(message.tool_call.as_ref().map(|call| call.name.as_str()), Some("lookup"));
    }

    #[test]
    fn tool_result_serializes_with_call_id() {
        let message = ChatMessage::tool_result("call-1", "{\"ok\":true}");
        let encoded = serde_json::to_value(&message).expect("serialize");

        assert_eq!(encoded["role"], "tool");
        assert_eq!(encoded["tool_call_id"], "call-1");
        assert!(encoded.get("tool_call").is_none());
    }
}
