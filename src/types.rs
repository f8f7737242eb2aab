use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of an agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<AgentToolCall>,
    /// Tool name, on tool-result turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl AgentMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
            is_error: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<AgentToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            name: None,
            tool_call_id: None,
            is_error: None,
        }
    }

    pub fn tool_result(call: &AgentToolCall, execution: &ToolExecution) -> Self {
        Self {
            role: Role::Tool,
            content: Some(execution.output.clone()),
            tool_calls: Vec::new(),
            name: Some(call.name.clone()),
            tool_call_id: Some(call.id.clone()),
            is_error: execution.is_error.then_some(true),
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Outcome of running one tool call. `output` is what the model sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub output: String,
    pub details: serde_json::Value,
    pub is_error: bool,
}

impl ToolExecution {
    pub fn ok(details: serde_json::Value) -> Self {
        let output = serde_json::to_string(&details).unwrap_or_else(|_| details.to_string());
        Self {
            output,
            details,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            output: format!("Error: {message}"),
            details: serde_json::json!({ "error": message }),
            is_error: true,
        }
    }
}
