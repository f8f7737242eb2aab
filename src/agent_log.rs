use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::AgentMessage;

/// One transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub thread: String,
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub ts_utc: i64,
}

impl AgentLogEntry {
    pub fn from_message(thread: &str, message: &AgentMessage) -> Self {
        let meta = if !message.tool_calls.is_empty() {
            Some(serde_json::json!({ "tool_calls": message.tool_calls }))
        } else {
            message.name.as_ref().map(|tool| {
                serde_json::json!({
                    "tool": tool,
                    "tool_call_id": message.tool_call_id,
                    "is_error": message.is_error.unwrap_or(false),
                })
            })
        };
        Self {
            thread: thread.to_string(),
            role: message.role.to_string(),
            text: message.content_str().to_string(),
            meta,
            ts_utc: Utc::now().timestamp(),
        }
    }
}

/// Appends `entry` to `<log_dir>/agent-YYYY-MM-DD.jsonl`.
pub fn append_log_jsonl(log_dir: &Path, entry: &AgentLogEntry) -> std::io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let filename = format!("agent-{}.jsonl", Utc::now().format("%Y-%m-%d"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(filename))?;
    let json = serde_json::to_string(entry)?;
    writeln!(file, "{json}")?;
    Ok(())
}
