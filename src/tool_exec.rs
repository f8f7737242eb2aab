use std::panic::{self, AssertUnwindSafe};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::tool_defs::{FIND_USER_NAMES, GET_SYSTEM_STATS, GET_USER_MESSAGES, SEARCH_MESSAGES};
use crate::{
    AgentToolCall, EntityResults, QaSystem, QuestionArgs, RetrievalError, SearchMessagesArgs,
    ToolError, ToolExecution,
};

/// A parsed, typed tool call. One variant per registered tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    GetUserMessages(QuestionArgs),
    FindUserNames(QuestionArgs),
    SearchMessages(SearchMessagesArgs),
    GetSystemStats,
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::BadArgs {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn flatten(results: EntityResults) -> Vec<String> {
    results
        .iter()
        .flat_map(|(_, docs)| docs.iter().cloned())
        .collect()
}

fn retrieval_failure(err: RetrievalError) -> ToolError {
    match err {
        RetrievalError::Uninitialized => ToolError::Failed("Retriever not initialized.".into()),
        err => {
            warn!(error = %err, "tool retrieval failed");
            ToolError::Failed("Could not retrieve information from the database.".into())
        }
    }
}

impl ToolInvocation {
    pub fn parse(name: &str, args: Value) -> Result<Self, ToolError> {
        match name {
            GET_USER_MESSAGES => Ok(Self::GetUserMessages(parse_args(name, args)?)),
            FIND_USER_NAMES => Ok(Self::FindUserNames(parse_args(name, args)?)),
            SEARCH_MESSAGES => Ok(Self::SearchMessages(parse_args(name, args)?)),
            GET_SYSTEM_STATS => Ok(Self::GetSystemStats),
            other => Err(ToolError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetUserMessages(_) => GET_USER_MESSAGES,
            Self::FindUserNames(_) => FIND_USER_NAMES,
            Self::SearchMessages(_) => SEARCH_MESSAGES,
            Self::GetSystemStats => GET_SYSTEM_STATS,
        }
    }

    pub fn execute(&self, qa: &QaSystem) -> Result<Value, ToolError> {
        match self {
            Self::GetUserMessages(args) => {
                let names = qa.resolver().resolve(&args.question);
                if names.is_empty() {
                    return Err(ToolError::Failed("No user name found in question.".into()));
                }
                let results = qa
                    .retriever()
                    .search_all(&names, &args.question, qa.entity_k())
                    .map_err(retrieval_failure)?;
                Ok(json!(flatten(results)))
            }
            Self::FindUserNames(args) => {
                let names = qa.resolver().resolve(&args.question);
                if names.is_empty() {
                    return Err(ToolError::Failed("No user name found in question.".into()));
                }
                Ok(json!(names))
            }
            Self::SearchMessages(args) => {
                let results = qa
                    .retriever()
                    .search_all(&args.user_names, &args.query, qa.entity_k())
                    .map_err(retrieval_failure)?;
                Ok(json!(flatten(results)))
            }
            Self::GetSystemStats => {
                let stats = qa.system_stats().map_err(retrieval_failure)?;
                serde_json::to_value(stats).map_err(|e| ToolError::Failed(e.to_string()))
            }
        }
    }
}

/// Runs `work`, turning a panic into [`ToolError::Panicked`].
pub(crate) fn guarded<F>(work: F) -> Result<Value, ToolError>
where
    F: FnOnce() -> Result<Value, ToolError>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(ToolError::Panicked(msg))
        }
    }
}

/// Executes one tool call. Never fails: unknown tools, bad arguments, tool
/// errors and panics all come back as an error execution.
pub fn execute_tool(call: &AgentToolCall, qa: &QaSystem) -> ToolExecution {
    let result = ToolInvocation::parse(&call.name, call.args.clone())
        .and_then(|invocation| guarded(|| invocation.execute(qa)));
    match result {
        Ok(value) => {
            debug!(tool = %call.name, "tool succeeded");
            ToolExecution::ok(value)
        }
        Err(err) => {
            warn!(tool = %call.name, error = %err, "tool failed");
            ToolExecution::error(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::testing::{FailingCompletion, StaticIndex};
    use crate::{AnswerSynthesizer, EntityRegistry, EntityResolver, FilteredRetriever};

    fn qa(retriever: FilteredRetriever) -> QaSystem {
        QaSystem::new(
            EntityResolver::new(Arc::new(EntityRegistry::builtin()), 70, 5),
            retriever,
            AnswerSynthesizer::new(Arc::new(FailingCompletion), 0.0, 16, Duration::from_secs(1)),
            10,
        )
    }

    fn seeded() -> QaSystem {
        qa(FilteredRetriever::new(Arc::new(StaticIndex::from_rows(&[
            ("Vikram Desai", "Vikram: aisle seat"),
            ("Layla Kawaguchi", "Layla: sushi at eight"),
        ]))))
    }

    fn call(name: &str, args: Value) -> AgentToolCall {
        AgentToolCall {
            id: "call_1".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn parse_builds_typed_variants() {
        let parsed =
            ToolInvocation::parse(SEARCH_MESSAGES, json!({"user_names": ["A"], "query": "q"}))
                .expect("parse");
        assert_eq!(
            parsed,
            ToolInvocation::SearchMessages(SearchMessagesArgs {
                user_names: vec!["A".into()],
                query: "q".into()
            })
        );
        assert_eq!(parsed.name(), SEARCH_MESSAGES);
        assert_eq!(
            ToolInvocation::parse(GET_SYSTEM_STATS, Value::Null).expect("stats"),
            ToolInvocation::GetSystemStats
        );
    }

    #[test]
    fn unknown_tool_is_an_error_turn() {
        let exec = execute_tool(&call("send_email", json!({})), &seeded());
        assert!(exec.is_error);
        assert_eq!(exec.output, "Error: unknown tool 'send_email'");
    }

    #[test]
    fn bad_arguments_are_an_error_turn() {
        let exec = execute_tool(&call(GET_USER_MESSAGES, json!({"q": 1})), &seeded());
        assert!(exec.is_error);
        assert!(exec.output.starts_with("Error: invalid arguments for get_user_messages"));
    }

    #[test]
    fn get_user_messages_resolves_and_filters() {
        let exec = execute_tool(
            &call(GET_USER_MESSAGES, json!({"question": "Where does Vikrem sit?"})),
            &seeded(),
        );
        assert!(!exec.is_error);
        assert_eq!(exec.details, json!(["Vikram: aisle seat"]));
        assert_eq!(exec.output, r#"["Vikram: aisle seat"]"#);
    }

    #[test]
    fn find_user_names_reports_missing_names() {
        let exec = execute_tool(
            &call(FIND_USER_NAMES, json!({"question": "what is the weather"})),
            &seeded(),
        );
        assert!(exec.is_error);
        assert_eq!(exec.output, "Error: No user name found in question.");
    }

    #[test]
    fn search_messages_keeps_requested_order() {
        let exec = execute_tool(
            &call(
                SEARCH_MESSAGES,
                json!({"user_names": ["Layla Kawaguchi", "Vikram Desai"], "query": "food"}),
            ),
            &seeded(),
        );
        assert_eq!(exec.details, json!(["Layla: sushi at eight", "Vikram: aisle seat"]));
    }

    #[test]
    fn stats_tool_reports_counts() {
        let exec = execute_tool(&call(GET_SYSTEM_STATS, json!({})), &seeded());
        assert_eq!(exec.details["number_of_messages"], 2);
        assert_eq!(exec.details["number_of_users"], 10);
    }

    #[test]
    fn disabled_retriever_is_reported_not_raised() {
        let exec = execute_tool(&call(GET_SYSTEM_STATS, json!({})), &qa(FilteredRetriever::disabled()));
        assert!(exec.is_error);
        assert_eq!(exec.output, "Error: Retriever not initialized.");
    }

    #[test]
    fn panics_are_converted() {
        let result = guarded(|| panic!("index exploded"));
        assert!(matches!(result, Err(ToolError::Panicked(msg)) if msg == "index exploded"));
    }
}
