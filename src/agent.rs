//! Tool-calling agent: a bounded THINKING / ACTING loop over the QA tools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    AgentLogEntry, AgentMessage, AgentToolCall, CheckpointStore, Completion, CompletionRequest,
    CompletionService, GENERATION_FAILED, SharedQa, ToolExecution, append_log_jsonl,
    complete_with_deadline, execute_tool, preview, tool_definitions_json,
};

pub const AGENT_INCOMPLETE: &str =
    "I could not complete this request within the allowed number of steps.";

pub const AGENT_SYSTEM_PROMPT: &str = "\
You answer questions about the members of a concierge service using only their messages.
Use the tools to look things up before answering:
- get_user_messages: messages of the member(s) a question is about. Misspelled names are fine.
- find_user_names: correctly spelled member names mentioned in a question.
- search_messages: messages of named members about a topic.
- get_system_stats: number of members, number of messages, and the member list.
If a tool returns an error, decide what to do next from the error text.
If the messages do not contain the answer, reply exactly: I do not have that information.
When you need a tool and cannot use the native tool channel, reply with only a JSON object
like {\"name\": \"get_user_messages\", \"arguments\": {\"question\": \"...\"}} and nothing else.
When you have the answer, reply with plain text and no JSON.";

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Maximum number of ACTING steps per run.
    pub max_steps: usize,
    pub temperature: f64,
    pub max_tokens: u64,
    pub timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            temperature: 0.0,
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Answered,
    StepLimit,
    GenerationFailed,
}

/// Result of one agent run. `messages` is the full conversation seen by the
/// model, system instruction first.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub answer: String,
    pub status: AgentStatus,
    pub acting_steps: usize,
    pub messages: Vec<AgentMessage>,
}

enum Phase {
    Thinking,
    Acting(Vec<AgentToolCall>),
    Done(String, AgentStatus),
}

pub struct Agent {
    qa: SharedQa,
    service: Arc<dyn CompletionService>,
    store: Arc<dyn CheckpointStore>,
    options: AgentOptions,
    /// One lock per conversation thread, held from history load to persist.
    threads: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Agent {
    pub fn new(
        qa: SharedQa,
        service: Arc<dyn CompletionService>,
        store: Arc<dyn CheckpointStore>,
        options: AgentOptions,
    ) -> Self {
        Self {
            qa,
            service,
            store,
            options,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Answers `question` within thread `thread_id`. Always returns a string.
    pub fn run(&self, thread_id: &str, question: &str) -> String {
        self.run_detailed(thread_id, question).answer
    }

    /// Runs on the same `thread_id` are serialized; distinct threads run concurrently.
    pub fn run_detailed(&self, thread_id: &str, question: &str) -> AgentOutcome {
        let lock = self.thread_lock(thread_id);
        let outcome = {
            let _turn = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.run_locked(thread_id, question)
        };
        self.release_thread_lock(thread_id, &lock);
        outcome
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(threads.entry(thread_id.to_string()).or_default())
    }

    fn release_thread_lock(&self, thread_id: &str, lock: &Arc<Mutex<()>>) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this run hold it: nobody is waiting on the thread.
        if Arc::strong_count(lock) == 2 {
            threads.remove(thread_id);
        }
    }

    fn run_locked(&self, thread_id: &str, question: &str) -> AgentOutcome {
        let history = self.store.load(thread_id).unwrap_or_else(|err| {
            warn!(thread = thread_id, error = %err, "checkpoint load failed, starting fresh");
            Vec::new()
        });
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(AgentMessage::system(AGENT_SYSTEM_PROMPT));
        messages.extend(history);
        let first_new = messages.len();
        messages.push(AgentMessage::user(question));

        let tools = tool_definitions_json();
        let mut acting_steps = 0;
        let mut phase = Phase::Thinking;
        let (answer, status) = loop {
            phase = match phase {
                Phase::Thinking => self.think(&mut messages, &tools, acting_steps),
                Phase::Acting(calls) => {
                    acting_steps += 1;
                    debug!(thread = thread_id, step = acting_steps, calls = calls.len(), "acting");
                    for (call, execution) in self.act(&calls) {
                        messages.push(AgentMessage::tool_result(&call, &execution));
                    }
                    Phase::Thinking
                }
                Phase::Done(answer, status) => break (answer, status),
            };
        };

        info!(
            thread = thread_id,
            steps = acting_steps,
            status = ?status,
            "agent run finished"
        );
        self.persist(thread_id, &messages[first_new..]);
        AgentOutcome {
            answer,
            status,
            acting_steps,
            messages,
        }
    }

    fn think(&self, messages: &mut Vec<AgentMessage>, tools: &[Value], acting_steps: usize) -> Phase {
        let request = CompletionRequest {
            messages: messages.clone(),
            tools: tools.to_vec(),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };
        let completion = match complete_with_deadline(&self.service, request, self.options.timeout)
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "agent completion failed");
                messages.push(AgentMessage::assistant(GENERATION_FAILED));
                return Phase::Done(GENERATION_FAILED.to_string(), AgentStatus::GenerationFailed);
            }
        };

        let calls = tool_calls_of(&completion);
        if calls.is_empty() {
            let text = completion.content.unwrap_or_default().trim().to_string();
            if text.is_empty() {
                warn!("agent completion returned no text");
                messages.push(AgentMessage::assistant(GENERATION_FAILED));
                return Phase::Done(GENERATION_FAILED.to_string(), AgentStatus::GenerationFailed);
            }
            messages.push(AgentMessage::assistant(text.clone()));
            return Phase::Done(text, AgentStatus::Answered);
        }

        if acting_steps >= self.options.max_steps {
            warn!(max_steps = self.options.max_steps, "agent step budget exhausted");
            messages.push(AgentMessage::assistant(AGENT_INCOMPLETE));
            return Phase::Done(AGENT_INCOMPLETE.to_string(), AgentStatus::StepLimit);
        }

        let content = if completion.tool_calls.is_some() {
            completion.content.filter(|c| !c.trim().is_empty())
        } else {
            None
        };
        messages.push(AgentMessage::assistant_tool_calls(content, calls.clone()));
        Phase::Acting(calls)
    }

    /// Runs every call; results keep invocation order.
    fn act(&self, calls: &[AgentToolCall]) -> Vec<(AgentToolCall, ToolExecution)> {
        let qa = self.qa.as_ref();
        let run = |call: &AgentToolCall| {
            debug!(tool = %call.name, args = %preview(&call.args.to_string(), 200), "tool call");
            (call.clone(), execute_tool(call, qa))
        };
        if calls.len() == 1 {
            return calls.iter().map(&run).collect();
        }
        ThreadPoolBuilder::new()
            .num_threads(calls.len().min(4))
            .build()
            .map(|pool| pool.install(|| calls.par_iter().map(&run).collect()))
            .unwrap_or_else(|_| calls.iter().map(&run).collect())
    }

    fn persist(&self, thread_id: &str, turns: &[AgentMessage]) {
        if let Err(err) = self.store.append(thread_id, turns) {
            warn!(thread = thread_id, error = %err, "checkpoint append failed");
        }
        if let Some(dir) = &self.options.log_dir {
            for turn in turns {
                if let Err(err) = append_log_jsonl(dir, &AgentLogEntry::from_message(thread_id, turn)) {
                    warn!(error = %err, "transcript append failed");
                    break;
                }
            }
        }
    }
}

/// Tool calls requested by a completion. The native channel wins whenever the
/// provider supplied one; otherwise the text is tried as a strict JSON call.
fn tool_calls_of(completion: &Completion) -> Vec<AgentToolCall> {
    match &completion.tool_calls {
        Some(calls) => calls
            .iter()
            .enumerate()
            .map(|(position, call)| {
                if call.id.trim().is_empty() {
                    AgentToolCall {
                        id: fallback_call_id(&call.name, &call.args, position),
                        ..call.clone()
                    }
                } else {
                    call.clone()
                }
            })
            .collect(),
        None => completion
            .content
            .as_deref()
            .and_then(parse_fallback_tool_calls)
            .unwrap_or_default(),
    }
}

pub(crate) fn fallback_call_id(name: &str, args: &Value, position: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(args.to_string().as_bytes());
    hasher.update(&(position as u64).to_le_bytes());
    format!("call_{}", &hasher.finalize().to_hex()[..12])
}

fn strip_code_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = body.strip_suffix("```") else {
        return text;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.trim()
}

fn fallback_call(value: &Value, position: usize) -> Option<AgentToolCall> {
    let obj = value.as_object()?;
    let name = obj
        .get("name")
        .or_else(|| obj.get("tool"))?
        .as_str()?
        .trim();
    if name.is_empty() {
        return None;
    }
    let args = match obj.get("arguments").or_else(|| obj.get("args"))? {
        Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
        other => other.clone(),
    };
    if !args.is_object() {
        return None;
    }
    Some(AgentToolCall {
        id: fallback_call_id(name, &args, position),
        name: name.to_string(),
        args,
    })
}

/// Parses a reply whose entire text is a JSON tool call (an object, or a
/// non-empty array of objects), each carrying `name`/`tool` and
/// `arguments`/`args`. Anything else means "no tool call".
pub fn parse_fallback_tool_calls(text: &str) -> Option<Vec<AgentToolCall>> {
    let body = strip_code_fence(text.trim());
    if !(body.starts_with('{') || body.starts_with('[')) {
        return None;
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let items = match &value {
        Value::Object(_) => vec![&value],
        Value::Array(items) if !items.is_empty() => items.iter().collect(),
        _ => return None,
    };
    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| fallback_call(item, position))
        .collect()
}
