//! Protocol events published to run consumers.
//!
//! Events follow the AG-UI wire shape: a `type` discriminator in
//! `SCREAMING_SNAKE_CASE`, camelCase field names, and optional fields
//! omitted when absent. Every event carries the `threadId` / `runId` pair
//! of the run that produced it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One event in a run's ordered output sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolEvent {
    pub thread_id: String,
    pub run_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Role attached to a text message span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Kind-specific payload of a [`ProtocolEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventKind {
    RunStarted,
    RunFinished,
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    TextMessageStart {
        message_id: String,
        role: Role,
    },
    TextMessageContent {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_call_id: Option<String>,
    },
    ToolCallArgs {
        tool_call_id: String,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StepStarted {
        step_id: String,
        step_name: String,
    },
    StepFinished {
        step_id: String,
        step_name: String,
    },
    StateSnapshot {
        snapshot: Value,
    },
    /// JSON Patch operations against the shared run state.
    StateDelta {
        delta: Vec<Value>,
    },
    Raw {
        event: Value,
    },
}

impl EventKind {
    /// The wire discriminator, e.g. `"TOOL_CALL_START"`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::RunFinished => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::StepStarted { .. } => "STEP_STARTED",
            Self::StepFinished { .. } => "STEP_FINISHED",
            Self::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Self::StateDelta { .. } => "STATE_DELTA",
            Self::Raw { .. } => "RAW",
        }
    }

    /// `true` for `RunFinished` and `RunError`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished | Self::RunError { .. })
    }
}

// ---------------------------------------------------------------------------
// Raw payloads
// ---------------------------------------------------------------------------

/// Payload for an informational `Raw` event.
pub fn system_log(message: impl Into<String>) -> Value {
    json!({ "type": "system_log", "message": message.into() })
}

/// Payload for a debug-level `Raw` event carrying agent diagnostics.
pub fn debug_log(message: impl Into<String>) -> Value {
    json!({ "type": "system_log", "level": "debug", "message": message.into() })
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds events stamped with one run's identity.
#[derive(Debug, Clone)]
pub struct EventFactory {
    thread_id: String,
    run_id: String,
}

impl EventFactory {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn event(&self, kind: EventKind) -> ProtocolEvent {
        ProtocolEvent {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn run_started(&self) -> ProtocolEvent {
        self.event(EventKind::RunStarted)
    }

    pub fn run_finished(&self) -> ProtocolEvent {
        self.event(EventKind::RunFinished)
    }

    pub fn run_error(&self, message: impl Into<String>, code: Option<String>) -> ProtocolEvent {
        self.event(EventKind::RunError {
            message: message.into(),
            code,
        })
    }

    pub fn raw(&self, event: Value) -> ProtocolEvent {
        self.event(EventKind::Raw { event })
    }

    pub fn system_log(&self, message: impl Into<String>) -> ProtocolEvent {
        self.raw(system_log(message))
    }
}
