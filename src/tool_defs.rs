use serde_json::{Value, json};

pub const GET_USER_MESSAGES: &str = "get_user_messages";
pub const FIND_USER_NAMES: &str = "find_user_names";
pub const SEARCH_MESSAGES: &str = "search_messages";
pub const GET_SYSTEM_STATS: &str = "get_system_stats";

pub fn tool_definitions_json() -> Vec<Value> {
    vec![
        json!({
            "name": GET_USER_MESSAGES,
            "description": "Find the member(s) a question is about (typos like 'Amona' or 'Vikrem' are fine) and return their messages most related to the question.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "The original user question." }
                },
                "required": ["question"]
            }
        }),
        json!({
            "name": FIND_USER_NAMES,
            "description": "Return the full, correctly spelled member names mentioned in a question.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "The user's question mentioning a person." }
                },
                "required": ["question"]
            }
        }),
        json!({
            "name": SEARCH_MESSAGES,
            "description": "Search the messages of specific members for a topic.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_names": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Full member names, e.g. 'Vikram Desai'."
                    },
                    "query": { "type": "string", "description": "What to look for, e.g. 'seat preference'." }
                },
                "required": ["user_names", "query"]
            }
        }),
        json!({
            "name": GET_SYSTEM_STATS,
            "description": "Number of members, number of messages and the member list. Use for questions like 'How many users are there?'.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}
