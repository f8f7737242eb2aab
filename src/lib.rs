//! Question answering over a member-message export: fuzzy member resolution,
//! per-member retrieval, grounded synthesis and evidence validation, plus a
//! bounded tool-calling agent over the same pieces.

mod agent;
mod agent_log;
mod checkpoint;
mod config;
mod context;
mod error;
pub mod fuzzy;
mod index;
mod llm;
mod pipeline;
mod resolver;
mod retriever;
mod server;
mod synthesizer;
mod tool_args;
pub mod tool_defs;
mod tool_exec;
mod types;
mod util;
mod validator;

#[cfg(test)]
mod testing;

// Flat namespace: every module refers to its siblings through `crate::`.
pub use agent::*;
pub use agent_log::*;
pub use checkpoint::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use index::*;
pub use llm::*;
pub use pipeline::*;
pub use resolver::*;
pub use retriever::*;
pub use server::*;
pub use synthesizer::*;
pub use tool_args::*;
pub use tool_defs::*;
pub use tool_exec::*;
pub use types::*;
pub use util::*;
pub use validator::*;
