use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    AgentMessage, AgentToolCall, LlmError, Role, backoff_delay, parse_retry_after, preview,
    run_with_deadline,
};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<AgentMessage>,
    /// Tool catalog entries (`name`, `description`, `inputSchema`).
    pub tools: Vec<Value>,
    pub temperature: f64,
    pub max_tokens: u64,
}

impl CompletionRequest {
    pub fn prompt(prompt: impl Into<String>, temperature: f64, max_tokens: u64) -> Self {
        Self {
            messages: vec![AgentMessage::user(prompt)],
            tools: Vec::new(),
            temperature,
            max_tokens,
        }
    }
}

/// A model reply.
///
/// `tool_calls` is `None` when the provider has no structured tool channel
/// for this reply; the agent then looks for a JSON tool call in `content`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<AgentToolCall>>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: None,
        }
    }
}

pub trait CompletionService: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Runs one completion on a worker thread bounded by `timeout`.
pub fn complete_with_deadline(
    service: &Arc<dyn CompletionService>,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<Completion, LlmError> {
    let service = Arc::clone(service);
    run_with_deadline(timeout, move || service.complete(&request))
        .unwrap_or(Err(LlmError::Timeout(timeout.as_millis() as u64)))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_secs: f64,
    pub max_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_secs: 0.5,
            max_secs: 4.0,
        }
    }
}

fn retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

/// POSTs `payload`, retrying 429/5xx and transport failures with backoff.
fn post_json_with_retries(
    provider: &str,
    build: impl Fn() -> ureq::Request,
    payload: &Value,
    retry: RetryPolicy,
) -> Result<Value, LlmError> {
    let mut last_err = LlmError::Transport("no attempt made".to_string());
    for attempt in 0..=retry.max_retries {
        match build().send_json(payload.clone()) {
            Ok(resp) => {
                let body = resp
                    .into_string()
                    .map_err(|e| LlmError::Transport(e.to_string()))?;
                return serde_json::from_str(&body)
                    .map_err(|e| LlmError::Malformed(format!("{e}: {}", preview(&body, 200))));
            }
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = parse_retry_after(&resp);
                let body = resp.into_string().unwrap_or_default();
                last_err = LlmError::Status { status: code, body };
                if attempt < retry.max_retries && retryable(code) {
                    let delay = backoff_delay(attempt, retry.base_secs, retry.max_secs, retry_after);
                    warn!(provider, status = code, attempt, ?delay, "retrying completion");
                    thread::sleep(delay);
                    continue;
                }
                break;
            }
            Err(ureq::Error::Transport(err)) => {
                last_err = LlmError::Transport(err.to_string());
                if attempt < retry.max_retries {
                    let delay = backoff_delay(attempt, retry.base_secs, retry.max_secs, None);
                    warn!(provider, error = %err, attempt, ?delay, "retrying completion");
                    thread::sleep(delay);
                    continue;
                }
                break;
            }
        }
    }
    Err(last_err)
}

// ── Anthropic ────────────────────────────────────────────────────────────

pub(crate) fn collect_system_blocks(messages: &[AgentMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|msg| msg.role == Role::System)
        .map(|msg| msg.content_str().trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn to_anthropic_messages(messages: &[AgentMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => continue,
            Role::User => out.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content_str()}]
            })),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content_str().is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content_str()}));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.args
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": ""}));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => {
                let Some(tool_id) = msg.tool_call_id.as_deref() else {
                    continue;
                };
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_id,
                    "content": msg.content_str(),
                });
                if msg.is_error.unwrap_or(false) {
                    block["is_error"] = json!(true);
                }
                // Results of one tool-use turn share a single user message.
                let previous = out.last_mut().filter(|prev: &&mut Value| {
                    prev["role"] == "user" && prev["content"][0]["type"] == "tool_result"
                });
                match previous.and_then(|prev| prev["content"].as_array_mut()) {
                    Some(blocks) => blocks.push(block),
                    None => out.push(json!({"role": "user", "content": [block]})),
                }
            }
        }
    }
    out
}

pub(crate) fn to_anthropic_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let mut entry = json!({ "name": name });
            if let Some(desc) = tool.get("description").and_then(Value::as_str) {
                entry["description"] = json!(desc);
            }
            if let Some(schema) = tool.get("inputSchema").or_else(|| tool.get("input_schema")) {
                entry["input_schema"] = schema.clone();
            }
            Some(entry)
        })
        .collect()
}

pub(crate) fn parse_anthropic_response(payload: &Value) -> Result<Completion, LlmError> {
    let content = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Malformed("response missing content".to_string()))?;
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        text_parts.push(text.to_string());
                    }
                }
            }
            "tool_use" => {
                let field = |key: &str| {
                    block
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                tool_calls.push(AgentToolCall {
                    id: field("id"),
                    name: field("name"),
                    args: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }

    Ok(Completion {
        content: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
        tool_calls: Some(tool_calls),
    })
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    api_key: String,
    model: String,
    url: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(
        api_key: Option<String>,
        model: Option<String>,
        url: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.ok_or_else(|| LlmError::MissingConfig("ANTHROPIC_API_KEY".into()))?;
        let model = model.ok_or_else(|| LlmError::MissingConfig("model".into()))?;
        Ok(Self {
            api_key,
            model,
            url: url.unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.to_string()),
            agent: http_agent(timeout),
            retry,
        })
    }

    pub(crate) fn payload(&self, request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": to_anthropic_messages(&request.messages),
        });
        let system_blocks = collect_system_blocks(&request.messages);
        if !system_blocks.is_empty() {
            payload["system"] = json!(system_blocks.join("\n\n"));
        }
        let tools = to_anthropic_tools(&request.tools);
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
        payload
    }
}

impl CompletionService for AnthropicClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let payload = self.payload(request);
        let build = || {
            self.agent
                .post(&self.url)
                .set("content-type", "application/json")
                .set("x-api-key", &self.api_key)
                .set("anthropic-version", ANTHROPIC_VERSION)
        };
        let response = post_json_with_retries("anthropic", build, &payload, self.retry)?;
        debug!(model = %self.model, "anthropic completion received");
        parse_anthropic_response(&response)
    }
}

// ── Ollama ───────────────────────────────────────────────────────────────

pub(crate) fn to_ollama_messages(messages: &[AgentMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut entry = json!({
                "role": msg.role.as_str(),
                "content": msg.content_str(),
            });
            if !msg.tool_calls.is_empty() {
                entry["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|call| json!({"function": {"name": call.name, "arguments": call.args}}))
                    .collect();
            }
            if let Some(name) = &msg.name {
                entry["tool_name"] = json!(name);
            }
            entry
        })
        .collect()
}

pub(crate) fn to_ollama_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.get("description").cloned().unwrap_or(json!("")),
                    "parameters": tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                }
            }))
        })
        .collect()
}

/// Reads `message.content` and, when the field is present, `message.tool_calls`.
/// Arguments may arrive as an object or as a JSON-encoded string.
pub(crate) fn parse_ollama_response(payload: &Value) -> Result<Completion, LlmError> {
    let message = payload
        .get("message")
        .ok_or_else(|| LlmError::Malformed("response missing message".to_string()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let tool_calls = message.get("tool_calls").and_then(Value::as_array).map(|calls| {
        calls
            .iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                let name = function.get("name")?.as_str()?.to_string();
                let args = match function.get("arguments") {
                    Some(Value::String(raw)) => {
                        serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                    }
                    Some(other) => other.clone(),
                    None => json!({}),
                };
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Some(AgentToolCall { id, name, args })
            })
            .collect()
    });

    Ok(Completion {
        content,
        tool_calls,
    })
}

/// Ollama `/api/chat` client.
pub struct OllamaClient {
    url: String,
    model: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl OllamaClient {
    pub fn new(
        base_url: Option<String>,
        model: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let base = base_url.unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Self {
            url: format!("{}/api/chat", base.trim_end_matches('/')),
            model: model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            agent: http_agent(timeout),
            retry,
        }
    }

    pub(crate) fn payload(&self, request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": to_ollama_messages(&request.messages),
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        let tools = to_ollama_tools(&request.tools);
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
        payload
    }
}

impl CompletionService for OllamaClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let payload = self.payload(request);
        let build = || {
            self.agent
                .post(&self.url)
                .set("content-type", "application/json")
        };
        let response = post_json_with_retries("ollama", build, &payload, self.retry)?;
        debug!(model = %self.model, "ollama completion received");
        parse_ollama_response(&response)
    }
}
