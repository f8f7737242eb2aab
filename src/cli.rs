use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aurora-qa")]
#[command(about = "Grounded question answering over member messages", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// JSON config file (default: $AURORA_CONFIG)
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Message index path (overrides config and $AURORA_DB)
    #[arg(long, global = true)]
    pub(crate) db: Option<PathBuf>,

    /// Completion provider: ollama or anthropic
    #[arg(long, global = true)]
    pub(crate) provider: Option<String>,

    #[arg(long, global = true)]
    pub(crate) model: Option<String>,

    /// Emit JSON instead of plain text
    #[arg(long, global = true)]
    pub(crate) json: bool,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    pub(crate) log_json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Load a JSON export (file or directory of *.json) into the message index.
    Ingest { path: PathBuf },

    /// Answer a question with the retrieval pipeline.
    Ask { question: String },

    /// Answer a question with the tool-calling agent.
    Agent {
        question: String,
        /// Conversation thread; reuse it to continue a conversation
        #[arg(short, long, default_value = "default")]
        thread: String,
        /// Override the step budget
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Show which members a question resolves to.
    Resolve { question: String },

    /// Search messages, optionally restricted to one member.
    Search {
        query: String,
        /// Exact member name
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short = 'k', long)]
        limit: Option<usize>,
    },

    /// Member and message counts.
    Stats,

    /// Print the effective configuration, or save it.
    Config {
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Serve POST /ask over HTTP.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Disable agent mode
        #[arg(long)]
        no_agent: bool,
    },
}
