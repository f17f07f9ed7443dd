//! Inbound run-request normalization.
//!
//! Clients send run requests with either camelCase (`threadId`) or
//! snake_case (`thread_id`) field names. [`normalize_run_request`] folds
//! both into one canonical [`RunRequest`], preferring camelCase when both
//! are present.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Canonical run request consumed by the run controller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub thread_id: String,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub messages: Vec<InputMessage>,
    pub tools: Vec<Value>,
    pub context: Vec<Value>,
    pub state: Value,
    pub forwarded_props: Value,
}

/// One role-tagged conversation message from the request history.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMessage {
    pub id: Option<String>,
    pub role: String,
    pub content: MessageContent,
    pub metadata: Option<Value>,
}

/// Message content as sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    /// Content blocks (`[{"type": "text", "text": "..."}, ...]`).
    Blocks(Vec<Value>),
    Empty,
}

/// Structural problems that reject a request before any event is produced.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("run request must be a JSON object")]
    NotAnObject,
    #[error("run request is missing the required `messages` field")]
    MissingMessages,
    #[error("malformed run request: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a loosely-typed run request.
///
/// `session_id` is the fallback thread id when the request carries none.
pub fn normalize_run_request(value: Value, session_id: &str) -> Result<RunRequest, NormalizeError> {
    let Value::Object(obj) = value else {
        return Err(NormalizeError::NotAnObject);
    };

    let messages = match obj.get("messages") {
        None | Some(Value::Null) => return Err(NormalizeError::MissingMessages),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_message(i, item))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(NormalizeError::Malformed(
                "`messages` must be an array".to_string(),
            ));
        }
    };

    let thread_id =
        string_field(&obj, "threadId", "thread_id").unwrap_or_else(|| session_id.to_string());
    let run_id =
        string_field(&obj, "runId", "run_id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let parent_run_id = string_field(&obj, "parentRunId", "parent_run_id");

    let tools = match obj.get("tools") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    // `context` may arrive as a keyed object; only a sequence is kept.
    let context = match obj.get("context") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let state = match obj.get("state") {
        Some(v @ Value::Object(_)) => v.clone(),
        _ => Value::Object(Map::new()),
    };
    let forwarded_props = match field(&obj, "forwardedProps", "forwarded_props") {
        Some(v @ Value::Object(_)) => v.clone(),
        _ => Value::Object(Map::new()),
    };

    Ok(RunRequest {
        thread_id,
        run_id,
        parent_run_id,
        messages,
        tools,
        context,
        state,
        forwarded_props,
    })
}

fn field<'a>(obj: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    obj.get(camel)
        .filter(|v| !v.is_null())
        .or_else(|| obj.get(snake).filter(|v| !v.is_null()))
}

fn string_field(obj: &Map<String, Value>, camel: &str, snake: &str) -> Option<String> {
    field(obj, camel, snake)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_message(index: usize, item: &Value) -> Result<InputMessage, NormalizeError> {
    let Value::Object(msg) = item else {
        return Err(NormalizeError::Malformed(format!(
            "message {index} must be an object"
        )));
    };

    let content = match msg.get("content") {
        Some(Value::String(s)) if !s.is_empty() => MessageContent::Text(s.clone()),
        Some(Value::Array(blocks)) if !blocks.is_empty() => MessageContent::Blocks(blocks.clone()),
        _ => MessageContent::Empty,
    };

    Ok(InputMessage {
        id: msg
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        role: msg
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        content,
        metadata: msg.get("metadata").filter(|v| v.is_object()).cloned(),
    })
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl RunRequest {
    /// Text of the most recent user message, if it has any.
    pub fn latest_user_prompt(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .and_then(|m| m.content.first_text())
            .filter(|t| !t.trim().is_empty())
    }
}

impl InputMessage {
    pub fn is_user(&self) -> bool {
        self.role == "user"
    }

    /// Whether the client asked for this message to be hidden from display.
    pub fn is_hidden(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("hidden"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Text echoed back into the event stream for this message.
    pub fn display_text(&self) -> String {
        match &self.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Empty => String::new(),
        }
    }
}

impl MessageContent {
    /// Plain text, or the first block exposing a `text` field.
    pub fn first_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Blocks(blocks) => blocks
                .iter()
                .find_map(|b| b.get("text").and_then(Value::as_str))
                .map(str::to_string),
            Self::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_case_preferred_over_snake_case() {
        let req = normalize_run_request(
            json!({
                "threadId": "camel-thread",
                "thread_id": "snake-thread",
                "run_id": "snake-run",
                "messages": []
            }),
            "session",
        )
        .unwrap();
        assert_eq!(req.thread_id, "camel-thread");
        assert_eq!(req.run_id, "snake-run");
    }

    #[test]
    fn thread_defaults_to_session_and_run_id_is_generated() {
        let a = normalize_run_request(json!({"messages": []}), "sess-1").unwrap();
        let b = normalize_run_request(json!({"messages": []}), "sess-1").unwrap();
        assert_eq!(a.thread_id, "sess-1");
        assert!(Uuid::parse_str(&a.run_id).is_ok());
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn keyed_context_becomes_empty_sequence() {
        let req = normalize_run_request(
            json!({"messages": [], "context": {"k": "v"}, "tools": null}),
            "s",
        )
        .unwrap();
        assert!(req.context.is_empty());
        assert!(req.tools.is_empty());
        assert_eq!(req.state, json!({}));
        assert_eq!(req.forwarded_props, json!({}));
    }

    #[test]
    fn forwarded_props_accepts_both_conventions() {
        let req = normalize_run_request(
            json!({"messages": [], "forwarded_props": {"a": 1}, "parentRunId": "p"}),
            "s",
        )
        .unwrap();
        assert_eq!(req.forwarded_props, json!({"a": 1}));
        assert_eq!(req.parent_run_id.as_deref(), Some("p"));
    }

    #[test]
    fn missing_messages_is_rejected() {
        let err = normalize_run_request(json!({"threadId": "t"}), "s").unwrap_err();
        assert!(matches!(err, NormalizeError::MissingMessages));
    }

    #[test]
    fn non_object_request_is_rejected() {
        let err = normalize_run_request(json!([1, 2]), "s").unwrap_err();
        assert!(matches!(err, NormalizeError::NotAnObject));
    }

    #[test]
    fn non_object_message_is_malformed() {
        let err = normalize_run_request(json!({"messages": ["hi"]}), "s").unwrap_err();
        assert!(matches!(err, NormalizeError::Malformed(_)));
    }

    #[test]
    fn latest_user_prompt_scans_in_reverse() {
        let req = normalize_run_request(
            json!({"messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [{"type": "image"}, {"type": "text", "text": "second"}]},
                {"role": "assistant", "content": "again"}
            ]}),
            "s",
        )
        .unwrap();
        assert_eq!(req.latest_user_prompt().as_deref(), Some("second"));
    }

    #[test]
    fn latest_user_prompt_none_without_user_messages() {
        let req = normalize_run_request(
            json!({"messages": [{"role": "assistant", "content": "x"}]}),
            "s",
        )
        .unwrap();
        assert_eq!(req.latest_user_prompt(), None);
    }

    #[test]
    fn hidden_metadata_flag() {
        let req = normalize_run_request(
            json!({"messages": [
                {"id": "m1", "role": "user", "content": "x", "metadata": {"hidden": true}},
                {"role": "user", "content": "y", "metadata": {"hidden": "yes"}}
            ]}),
            "s",
        )
        .unwrap();
        assert!(req.messages[0].is_hidden());
        assert!(!req.messages[1].is_hidden());
        assert_eq!(req.messages[0].id.as_deref(), Some("m1"));
        assert_eq!(req.messages[1].id, None);
    }
}
