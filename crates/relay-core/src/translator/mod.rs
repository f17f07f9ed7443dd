//! Agent-message to protocol-event translation.
//!
//! [`EventTranslator`] consumes the agent's message sequence one message at
//! a time and emits zero or more [`ProtocolEvent`]s for each, tracking open
//! text and tool-call spans so every start is paired with exactly one end.
//!
//! Span rules:
//! - At most one text span is open at a time. A new `message_start` closes
//!   the previous span first.
//! - Text spans are closed after a structured message's blocks have been
//!   processed.
//! - Tool spans open on a tool-use block and close on the matching
//!   tool-result block. Results for ids that are not open are dropped.

use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{
    AgentMessage, ContentBlock, MessageRole, ResultMessage, StreamDelta, StructuredMessage,
    SystemMessage,
};
use crate::events::{EventFactory, EventKind, ProtocolEvent, Role, debug_log};
use crate::tracker::TurnTracker;

/// Step name bracketing the agent's work on a prompt.
pub const PROCESSING_STEP: &str = "processing_prompt";

/// Error attached to tool spans still open when the agent finishes.
const UNFINISHED_TOOL_ERROR: &str = "tool call did not complete";

/// Spans opened during translation and not yet closed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OpenSpans {
    text: Option<String>,
    /// Open tool-call ids in the order they were started.
    tools: Vec<String>,
}

impl OpenSpans {
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.tools.is_empty()
    }
}

/// Stateful translator for one run.
pub struct EventTranslator {
    factory: EventFactory,
    spans: OpenSpans,
    turn_count: u32,
    agent_session_id: Option<String>,
}

impl EventTranslator {
    /// `turn_count` seeds the monotonic turn counter from the session.
    pub fn new(factory: EventFactory, turn_count: u32) -> Self {
        Self {
            factory,
            spans: OpenSpans::default(),
            turn_count,
            agent_session_id: None,
        }
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Session id reported by the agent's init message.
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }

    pub fn open_spans(&self) -> &OpenSpans {
        &self.spans
    }

    /// Translate one agent message.
    pub async fn translate(
        &mut self,
        message: AgentMessage,
        tracker: &mut TurnTracker,
    ) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        match message {
            AgentMessage::StreamDelta(delta) => self.on_stream_delta(delta, &mut out),
            AgentMessage::System(system) => self.on_system(system, &mut out),
            AgentMessage::Structured(structured) => {
                self.on_structured(structured, tracker, &mut out).await
            }
            AgentMessage::Result(result) => self.on_result(result, tracker, &mut out).await,
        }
        out
    }

    /// Close every span still open, text first, then tools in start order.
    pub fn close_open_spans(&mut self) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        self.close_text_span(&mut out);
        for tool_call_id in self.spans.tools.drain(..) {
            warn!(tool_call_id = %tool_call_id, "closing unfinished tool call");
            out.push(self.factory.event(EventKind::ToolCallEnd {
                tool_call_id,
                result: None,
                error: Some(UNFINISHED_TOOL_ERROR.to_string()),
            }));
        }
        out
    }

    // -----------------------------------------------------------------------
    // Per-variant handlers
    // -----------------------------------------------------------------------

    fn on_stream_delta(&mut self, delta: StreamDelta, out: &mut Vec<ProtocolEvent>) {
        match delta {
            StreamDelta::MessageStart => {
                self.close_text_span(out);
                self.open_text_span(out);
            }
            StreamDelta::TextDelta(text) => {
                if text.is_empty() {
                    return;
                }
                if self.spans.text.is_none() {
                    self.open_text_span(out);
                }
                if let Some(message_id) = self.spans.text.clone() {
                    out.push(self.factory.event(EventKind::TextMessageContent {
                        message_id,
                        delta: text,
                    }));
                }
            }
            StreamDelta::Other => {}
        }
    }

    fn on_system(&mut self, system: SystemMessage, out: &mut Vec<ProtocolEvent>) {
        if system.subtype == "init" {
            if let Some(session_id) = system.session_id {
                info!(agent_session_id = %session_id, "captured agent session id");
                self.agent_session_id = Some(session_id);
            }
        }
        if let Some(text) = system.text {
            out.push(self.factory.raw(debug_log(text)));
        }
    }

    async fn on_structured(
        &mut self,
        message: StructuredMessage,
        tracker: &mut TurnTracker,
        out: &mut Vec<ProtocolEvent>,
    ) {
        if message.role == MessageRole::Assistant {
            let text: String = message
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            tracker.start_turn(&text).await;
        }

        let had_blocks = !message.blocks.is_empty();
        for block in message.blocks {
            match block {
                ContentBlock::Text { text } => {
                    debug!(len = text.len(), "text block received (already streamed)");
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let name = name.unwrap_or_else(|| "unknown".to_string());
                    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
                    if self.spans.tools.contains(&id) {
                        warn!(tool_call_id = %id, "duplicate tool use ignored");
                        continue;
                    }
                    info!(tool = %name, tool_call_id = %id, "tool use");
                    self.spans.tools.push(id.clone());
                    out.push(self.factory.event(EventKind::ToolCallStart {
                        tool_call_id: id.clone(),
                        tool_call_name: name.clone(),
                        parent_tool_call_id: message.parent_tool_use_id.clone(),
                    }));

                    let input = input.unwrap_or_else(|| json!({}));
                    if has_input(&input) {
                        out.push(self.factory.event(EventKind::ToolCallArgs {
                            tool_call_id: id.clone(),
                            delta: input.to_string(),
                        }));
                    }
                    tracker.track_tool_use(&name, &id, &input).await;
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let serialized = content.as_ref().map(Value::to_string).unwrap_or_default();
                    if let Some(id) = &tool_use_id {
                        if let Some(pos) = self.spans.tools.iter().position(|t| t == id) {
                            self.spans.tools.remove(pos);
                            let (result, error) = if is_error {
                                (None, Some(serialized))
                            } else {
                                (Some(serialized), None)
                            };
                            out.push(self.factory.event(EventKind::ToolCallEnd {
                                tool_call_id: id.clone(),
                                result,
                                error,
                            }));
                        } else {
                            warn!(tool_call_id = %id, "tool result for unknown tool call dropped");
                        }
                    }
                    tracker
                        .track_tool_result(tool_use_id.as_deref(), content.as_ref(), is_error)
                        .await;
                }
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    out.push(self.factory.raw(json!({
                        "type": "thinking_block",
                        "thinking": thinking,
                        "signature": signature,
                    })));
                }
            }
        }

        if had_blocks {
            self.close_text_span(out);
        }
    }

    async fn on_result(
        &mut self,
        result: ResultMessage,
        tracker: &mut TurnTracker,
        out: &mut Vec<ProtocolEvent>,
    ) {
        if let Some(reported) = result.num_turns {
            if reported > self.turn_count {
                self.turn_count = reported;
            }
        }
        info!(
            subtype = %result.subtype,
            num_turns = ?result.num_turns,
            is_error = result.is_error,
            "agent result"
        );
        tracker
            .end_turn(self.turn_count, result.usage.as_ref(), result.total_cost_usd)
            .await;

        let payload = json!({
            "subtype": result.subtype,
            "duration_ms": result.duration_ms,
            "is_error": result.is_error,
            "num_turns": result.num_turns,
            "total_cost_usd": result.total_cost_usd,
            "usage": result.usage,
            "result": result.result,
        });
        out.push(self.factory.event(EventKind::StateDelta {
            delta: vec![json!({ "op": "replace", "path": "/lastResult", "value": payload })],
        }));
    }

    // -----------------------------------------------------------------------
    // Span helpers
    // -----------------------------------------------------------------------

    fn open_text_span(&mut self, out: &mut Vec<ProtocolEvent>) {
        let message_id = Uuid::new_v4().to_string();
        self.spans.text = Some(message_id.clone());
        out.push(self.factory.event(EventKind::TextMessageStart {
            message_id,
            role: Role::Assistant,
        }));
    }

    fn close_text_span(&mut self, out: &mut Vec<ProtocolEvent>) {
        if let Some(message_id) = self.spans.text.take() {
            out.push(self.factory.event(EventKind::TextMessageEnd { message_id }));
        }
    }
}

/// Whether a tool input carries anything worth streaming as arguments.
fn has_input(input: &Value) -> bool {
    match input {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NoopSink;
    use std::sync::Arc;

    fn setup() -> (EventTranslator, TurnTracker) {
        (
            EventTranslator::new(EventFactory::new("t", "r"), 0),
            TurnTracker::new(Arc::new(NoopSink), "model", "prompt"),
        )
    }

    fn assistant(blocks: Vec<ContentBlock>) -> AgentMessage {
        AgentMessage::Structured(StructuredMessage {
            role: MessageRole::Assistant,
            model: None,
            parent_tool_use_id: None,
            blocks,
        })
    }

    fn tool_result(id: &str, content: Value, is_error: bool) -> AgentMessage {
        AgentMessage::Structured(StructuredMessage {
            role: MessageRole::User,
            model: None,
            parent_tool_use_id: None,
            blocks: vec![ContentBlock::ToolResult {
                tool_use_id: Some(id.to_string()),
                content: Some(content),
                is_error,
            }],
        })
    }

    fn kinds(events: &[ProtocolEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind.wire_name()).collect()
    }

    #[tokio::test]
    async fn streamed_text_is_closed_by_structured_message() {
        let (mut tr, mut tk) = setup();
        let mut events = Vec::new();
        events.extend(tr.translate(AgentMessage::StreamDelta(StreamDelta::MessageStart), &mut tk).await);
        events.extend(
            tr.translate(AgentMessage::StreamDelta(StreamDelta::TextDelta("Hi".into())), &mut tk)
                .await,
        );
        events.extend(
            tr.translate(AgentMessage::StreamDelta(StreamDelta::TextDelta(String::new())), &mut tk)
                .await,
        );
        events.extend(
            tr.translate(assistant(vec![ContentBlock::Text { text: "Hi".into() }]), &mut tk)
                .await,
        );

        assert_eq!(
            kinds(&events),
            vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT", "TEXT_MESSAGE_END"]
        );
        let EventKind::TextMessageStart { message_id, role } = &events[0].kind else {
            panic!("expected start");
        };
        assert_eq!(*role, Role::Assistant);
        assert_eq!(
            events[2].kind,
            EventKind::TextMessageEnd {
                message_id: message_id.clone()
            }
        );
        assert!(tr.open_spans().is_empty());
    }

    #[tokio::test]
    async fn second_message_start_closes_previous_span() {
        let (mut tr, mut tk) = setup();
        let mut events = Vec::new();
        for _ in 0..2 {
            events.extend(
                tr.translate(AgentMessage::StreamDelta(StreamDelta::MessageStart), &mut tk)
                    .await,
            );
        }
        assert_eq!(
            kinds(&events),
            vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_END", "TEXT_MESSAGE_START"]
        );
    }

    #[tokio::test]
    async fn delta_without_open_span_opens_one() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(AgentMessage::StreamDelta(StreamDelta::TextDelta("x".into())), &mut tk)
            .await;
        assert_eq!(kinds(&events), vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT"]);
    }

    #[tokio::test]
    async fn tool_use_and_result_pair_up() {
        let (mut tr, mut tk) = setup();
        let start = tr
            .translate(
                assistant(vec![ContentBlock::ToolUse {
                    id: Some("toolu_1".into()),
                    name: Some("Bash".into()),
                    input: Some(json!({"command": "ls"})),
                }]),
                &mut tk,
            )
            .await;
        assert_eq!(kinds(&start), vec!["TOOL_CALL_START", "TOOL_CALL_ARGS"]);
        assert_eq!(
            start[1].kind,
            EventKind::ToolCallArgs {
                tool_call_id: "toolu_1".into(),
                delta: r#"{"command":"ls"}"#.into()
            }
        );
        assert_eq!(tr.open_spans().tools(), ["toolu_1".to_string()]);

        let end = tr.translate(tool_result("toolu_1", json!("a\nb"), false), &mut tk).await;
        assert_eq!(
            end[0].kind,
            EventKind::ToolCallEnd {
                tool_call_id: "toolu_1".into(),
                result: Some(r#""a\nb""#.into()),
                error: None,
            }
        );
        assert!(tr.open_spans().is_empty());
        assert_eq!(tk.usage().tool_uses, 1);
        assert_eq!(tk.usage().tool_results, 1);
    }

    #[tokio::test]
    async fn error_result_goes_to_error_field() {
        let (mut tr, mut tk) = setup();
        tr.translate(
            assistant(vec![ContentBlock::ToolUse {
                id: Some("t".into()),
                name: Some("Read".into()),
                input: Some(json!({"path": "x"})),
            }]),
            &mut tk,
        )
        .await;
        let end = tr
            .translate(tool_result("t", json!([{"type": "text", "text": "nope"}]), true), &mut tk)
            .await;
        let EventKind::ToolCallEnd { result, error, .. } = &end[0].kind else {
            panic!("expected tool end");
        };
        assert!(result.is_none());
        assert_eq!(error.as_deref(), Some(r#"[{"text":"nope","type":"text"}]"#));
    }

    #[tokio::test]
    async fn tool_use_without_input_emits_no_args() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                assistant(vec![ContentBlock::ToolUse {
                    id: None,
                    name: None,
                    input: None,
                }]),
                &mut tk,
            )
            .await;
        assert_eq!(kinds(&events), vec!["TOOL_CALL_START"]);
        let EventKind::ToolCallStart {
            tool_call_id,
            tool_call_name,
            ..
        } = &events[0].kind
        else {
            panic!("expected tool start");
        };
        assert_eq!(tool_call_name, "unknown");
        assert!(Uuid::parse_str(tool_call_id).is_ok());
    }

    #[tokio::test]
    async fn empty_object_input_emits_no_args() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                assistant(vec![ContentBlock::ToolUse {
                    id: Some("t".into()),
                    name: Some("TodoRead".into()),
                    input: Some(json!({})),
                }]),
                &mut tk,
            )
            .await;
        assert_eq!(kinds(&events), vec!["TOOL_CALL_START"]);
    }

    #[tokio::test]
    async fn nested_tool_calls_carry_parent() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                AgentMessage::Structured(StructuredMessage {
                    role: MessageRole::Assistant,
                    model: None,
                    parent_tool_use_id: Some("task_1".into()),
                    blocks: vec![ContentBlock::ToolUse {
                        id: Some("child".into()),
                        name: Some("Grep".into()),
                        input: None,
                    }],
                }),
                &mut tk,
            )
            .await;
        let EventKind::ToolCallStart {
            parent_tool_call_id,
            ..
        } = &events[0].kind
        else {
            panic!("expected tool start");
        };
        assert_eq!(parent_tool_call_id.as_deref(), Some("task_1"));
    }

    #[tokio::test]
    async fn duplicate_tool_use_is_not_restarted() {
        let (mut tr, mut tk) = setup();
        let block = || ContentBlock::ToolUse {
            id: Some("t".into()),
            name: Some("Bash".into()),
            input: None,
        };
        let first = tr.translate(assistant(vec![block()]), &mut tk).await;
        let second = tr.translate(assistant(vec![block()]), &mut tk).await;
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn result_for_unknown_tool_is_dropped() {
        let (mut tr, mut tk) = setup();
        let events = tr.translate(tool_result("ghost", json!("x"), false), &mut tk).await;
        assert!(events.is_empty());
        assert_eq!(tk.usage().tool_results, 1);
    }

    #[tokio::test]
    async fn tool_result_without_id_is_skipped() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                AgentMessage::Structured(StructuredMessage {
                    role: MessageRole::User,
                    model: None,
                    parent_tool_use_id: None,
                    blocks: vec![ContentBlock::ToolResult {
                        tool_use_id: None,
                        content: None,
                        is_error: false,
                    }],
                }),
                &mut tk,
            )
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn thinking_block_is_raw() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                assistant(vec![ContentBlock::Thinking {
                    thinking: "let me see".into(),
                    signature: "sig".into(),
                }]),
                &mut tk,
            )
            .await;
        assert_eq!(
            events[0].kind,
            EventKind::Raw {
                event: json!({"type": "thinking_block", "thinking": "let me see", "signature": "sig"})
            }
        );
    }

    #[tokio::test]
    async fn system_init_captures_session_without_events() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                AgentMessage::System(SystemMessage {
                    subtype: "init".into(),
                    session_id: Some("sess".into()),
                    text: None,
                }),
                &mut tk,
            )
            .await;
        assert!(events.is_empty());
        assert_eq!(tr.agent_session_id(), Some("sess"));
    }

    #[tokio::test]
    async fn system_text_becomes_debug_log() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                AgentMessage::System(SystemMessage {
                    subtype: "notice".into(),
                    session_id: None,
                    text: Some("compacting".into()),
                }),
                &mut tk,
            )
            .await;
        assert_eq!(
            events[0].kind,
            EventKind::Raw {
                event: json!({"type": "system_log", "level": "debug", "message": "compacting"})
            }
        );
    }

    #[tokio::test]
    async fn result_emits_last_result_delta_and_raises_turns() {
        let (mut tr, mut tk) = setup();
        let events = tr
            .translate(
                AgentMessage::Result(ResultMessage {
                    subtype: "success".into(),
                    duration_ms: Some(10),
                    num_turns: Some(4),
                    result: Some("done".into()),
                    ..ResultMessage::default()
                }),
                &mut tk,
            )
            .await;
        assert_eq!(tr.turn_count(), 4);
        let EventKind::StateDelta { delta } = &events[0].kind else {
            panic!("expected state delta");
        };
        assert_eq!(delta[0]["op"], "replace");
        assert_eq!(delta[0]["path"], "/lastResult");
        assert_eq!(delta[0]["value"]["num_turns"], 4);
        assert_eq!(delta[0]["value"]["result"], "done");
    }

    #[tokio::test]
    async fn turn_count_never_decreases() {
        let mut tr = EventTranslator::new(EventFactory::new("t", "r"), 5);
        let mut tk = TurnTracker::new(Arc::new(NoopSink), "m", "p");
        tr.translate(
            AgentMessage::Result(ResultMessage {
                num_turns: Some(2),
                ..ResultMessage::default()
            }),
            &mut tk,
        )
        .await;
        assert_eq!(tr.turn_count(), 5);
    }

    #[tokio::test]
    async fn close_open_spans_drains_everything() {
        let (mut tr, mut tk) = setup();
        tr.translate(AgentMessage::StreamDelta(StreamDelta::MessageStart), &mut tk).await;
        tr.translate(
            AgentMessage::StreamDelta(StreamDelta::TextDelta("partial".into())),
            &mut tk,
        )
        .await;
        // Tool use arrives as a separate message; text span gets closed by it.
        tr.translate(
            assistant(vec![ContentBlock::ToolUse {
                id: Some("t".into()),
                name: Some("Bash".into()),
                input: None,
            }]),
            &mut tk,
        )
        .await;
        tr.translate(AgentMessage::StreamDelta(StreamDelta::MessageStart), &mut tk).await;

        let closing = tr.close_open_spans();
        assert_eq!(kinds(&closing), vec!["TEXT_MESSAGE_END", "TOOL_CALL_END"]);
        let EventKind::ToolCallEnd { error, .. } = &closing[1].kind else {
            panic!("expected tool end");
        };
        assert_eq!(error.as_deref(), Some(UNFINISHED_TOOL_ERROR));
        assert!(tr.open_spans().is_empty());
        assert!(tr.close_open_spans().is_empty());
    }
}
