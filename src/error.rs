use std::io;

/// Message index errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index not found: {0}")]
    NotFound(String),
}

/// Retriever outcome when no documents can be produced.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// The index failed to open when the retriever was built.
    #[error("message index is not initialized")]
    Uninitialized,

    #[error("similarity search timed out after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Completion service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("completion timed out after {0} ms")]
    Timeout(u64),
}

/// Tool dispatch and execution errors. Each one becomes an error-content turn.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    Unknown(String),

    #[error("invalid arguments for {tool}: {reason}")]
    BadArgs { tool: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("tool panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error used by the binary and the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server: {0}")]
    Server(String),
}
