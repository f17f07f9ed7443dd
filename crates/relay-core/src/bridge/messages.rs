//! Agent output messages and the stream-json line parser.
//!
//! Claude Code emits one JSON object per stdout line. Each line is mapped
//! into the closed [`AgentMessage`] variant here, so nothing downstream
//! inspects raw JSON for optional fields.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One message from the agent process, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Fine-grained partial-message event.
    StreamDelta(StreamDelta),
    System(SystemMessage),
    Structured(StructuredMessage),
    Result(ResultMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    MessageStart,
    TextDelta(String),
    /// Any other partial event (block start/stop, tool input deltas, ...).
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    pub subtype: String,
    /// Set on the `init` message.
    pub session_id: Option<String>,
    /// Free-text diagnostic content, when the message carries any.
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    Assistant,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMessage {
    pub role: MessageRole,
    pub model: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: Option<String>,
        name: Option<String>,
        input: Option<Value>,
    },
    ToolResult {
        tool_use_id: Option<String>,
        content: Option<Value>,
        is_error: bool,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultMessage {
    pub subtype: String,
    pub duration_ms: Option<u64>,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Value>,
    pub result: Option<String>,
}

/// What a single stdout line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Message(AgentMessage),
    /// Reply to a control request we sent (initialize, interrupt).
    ControlResponse { request_id: Option<String>, error: Option<String> },
    /// Recognised JSON we have no use for.
    Ignored,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireLine {
    StreamEvent {
        event: WireStreamEvent,
    },
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        message: Option<Value>,
    },
    Assistant {
        message: WireMessage,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    User {
        message: WireMessage,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    Result(WireResult),
    ControlResponse {
        response: WireControlResponse,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart {},
    ContentBlockDelta { delta: WireDelta },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct WireControlResponse {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one stream-json line.
///
/// Returns `Err` only when the line is not valid JSON or does not match a
/// known message shape. Callers should log and keep reading.
pub fn parse_stream_json_line(line: &str) -> Result<StreamLine, serde_json::Error> {
    let wire: WireLine = serde_json::from_str(line)?;

    let parsed = match wire {
        WireLine::StreamEvent { event } => {
            let delta = match event {
                WireStreamEvent::MessageStart {} => StreamDelta::MessageStart,
                WireStreamEvent::ContentBlockDelta {
                    delta: WireDelta::TextDelta { text },
                } => StreamDelta::TextDelta(text),
                WireStreamEvent::ContentBlockDelta { .. } | WireStreamEvent::Other => {
                    StreamDelta::Other
                }
            };
            StreamLine::Message(AgentMessage::StreamDelta(delta))
        }
        WireLine::System {
            subtype,
            session_id,
            text,
            message,
        } => {
            let text = text.or_else(|| message.and_then(|m| m.as_str().map(str::to_string)));
            StreamLine::Message(AgentMessage::System(SystemMessage {
                subtype,
                session_id,
                text: text.filter(|t| !t.is_empty()),
            }))
        }
        WireLine::Assistant {
            message,
            parent_tool_use_id,
        } => StreamLine::Message(AgentMessage::Structured(structured(
            MessageRole::Assistant,
            message,
            parent_tool_use_id,
        ))),
        WireLine::User {
            message,
            parent_tool_use_id,
        } => StreamLine::Message(AgentMessage::Structured(structured(
            MessageRole::User,
            message,
            parent_tool_use_id,
        ))),
        WireLine::Result(r) => StreamLine::Message(AgentMessage::Result(ResultMessage {
            subtype: r.subtype,
            duration_ms: r.duration_ms,
            is_error: r.is_error,
            num_turns: r.num_turns,
            session_id: r.session_id,
            total_cost_usd: r.total_cost_usd,
            usage: r.usage,
            result: r.result,
        })),
        WireLine::ControlResponse { response } => StreamLine::ControlResponse {
            request_id: response.request_id,
            error: response.error,
        },
        WireLine::Other => {
            debug!(line, "ignoring unrecognised stream-json line");
            StreamLine::Ignored
        }
    };

    Ok(parsed)
}

fn structured(
    role: MessageRole,
    message: WireMessage,
    parent_tool_use_id: Option<String>,
) -> StructuredMessage {
    let blocks = match message.content {
        Some(WireContent::Text(text)) => vec![ContentBlock::Text { text }],
        Some(WireContent::Blocks(blocks)) => {
            blocks.into_iter().filter_map(content_block).collect()
        }
        None => Vec::new(),
    };
    StructuredMessage {
        role,
        model: message.model,
        parent_tool_use_id,
        blocks,
    }
}

fn content_block(block: WireBlock) -> Option<ContentBlock> {
    match block {
        WireBlock::Text { text } => Some(ContentBlock::Text { text }),
        WireBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
            id: id.filter(|s| !s.is_empty()),
            name: name.filter(|s| !s.is_empty()),
            input,
        }),
        WireBlock::ToolResult {
            tool_use_id,
            content,
            text,
            is_error,
        } => Some(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.filter(|s| !s.is_empty()),
            content: content
                .filter(|c| !c.is_null())
                .or_else(|| text.map(Value::String)),
            is_error: is_error.unwrap_or(false),
        }),
        WireBlock::Thinking {
            thinking,
            signature,
        } => Some(ContentBlock::Thinking {
            thinking,
            signature,
        }),
        WireBlock::Other => None,
    }
}
