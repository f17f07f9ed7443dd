//! Shared test utilities for relay integration tests.
//!
//! - [`ScriptedBridge`]: an in-memory [`AgentBridge`] that replays a fixed
//!   message script and records how it was driven.
//! - Message builders for common agent output shapes.
//! - Event-sequence assertions for span pairing and terminal events.
//! - [`write_fake_claude`]: writes an executable shell script standing in
//!   for the `claude` binary.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::Notify;

use relay_core::bridge::{
    AgentBridge, AgentMessage, AgentMessageStream, AgentProcess, BridgeError, ContentBlock,
    LaunchSpec, MessageRole, ProcessControl, ResultMessage, StreamDelta, StructuredMessage,
    SystemMessage,
};
use relay_core::events::{EventKind, ProtocolEvent};

// ---------------------------------------------------------------------------
// Scripted bridge
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BridgeLog {
    launches: Mutex<Vec<LaunchSpec>>,
    prompts: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    stops: AtomicUsize,
}

/// Replays `messages` from every process it starts.
pub struct ScriptedBridge {
    messages: Vec<AgentMessage>,
    start_failures: Mutex<VecDeque<BridgeError>>,
    receive_failure: Mutex<Option<BridgeError>>,
    pause_after: Option<usize>,
    log: Arc<BridgeLog>,
}

impl ScriptedBridge {
    pub fn new(messages: Vec<AgentMessage>) -> Self {
        Self {
            messages,
            start_failures: Mutex::new(VecDeque::new()),
            receive_failure: Mutex::new(None),
            pause_after: None,
            log: Arc::new(BridgeLog::default()),
        }
    }

    /// Fail the next `start` with `error`. May be called repeatedly.
    pub fn fail_start(self, error: BridgeError) -> Self {
        self.start_failures.lock().unwrap().push_back(error);
        self
    }

    /// End the next process's message sequence with `error` instead of
    /// finishing cleanly.
    pub fn fail_receive(self, error: BridgeError) -> Self {
        *self.receive_failure.lock().unwrap() = Some(error);
        self
    }

    /// Block the message sequence after `n` messages until interrupted.
    pub fn pause_after(mut self, n: usize) -> Self {
        self.pause_after = Some(n);
        self
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.log.launches.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.log.prompts.lock().unwrap().clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.log.interrupts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.log.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBridge for ScriptedBridge {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, BridgeError> {
        self.log.launches.lock().unwrap().push(spec.clone());
        if let Some(error) = self.start_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(Box::new(ScriptedProcess {
            messages: self.messages.clone().into(),
            failure: self.receive_failure.lock().unwrap().take(),
            pause_after: self.pause_after,
            control: Arc::new(ScriptedControl {
                log: Arc::clone(&self.log),
                resume: Arc::new(Notify::new()),
            }),
            log: Arc::clone(&self.log),
        }))
    }
}

struct ScriptedControl {
    log: Arc<BridgeLog>,
    resume: Arc<Notify>,
}

#[async_trait]
impl ProcessControl for ScriptedControl {
    async fn interrupt(&self) -> Result<(), BridgeError> {
        self.log.interrupts.fetch_add(1, Ordering::SeqCst);
        self.resume.notify_one();
        Ok(())
    }
}

struct ScriptedProcess {
    messages: VecDeque<AgentMessage>,
    failure: Option<BridgeError>,
    pause_after: Option<usize>,
    control: Arc<ScriptedControl>,
    log: Arc<BridgeLog>,
}

#[async_trait]
impl AgentProcess for ScriptedProcess {
    fn control(&self) -> Arc<dyn ProcessControl> {
        self.control.clone()
    }

    async fn query(&mut self, prompt: &str) -> Result<(), BridgeError> {
        self.log.prompts.lock().unwrap().push(prompt.to_string());
        Ok(())
    }

    fn receive(&mut self) -> AgentMessageStream<'_> {
        let messages = std::mem::take(&mut self.messages);
        let failure = self.failure.take();
        let pause_after = self.pause_after;
        let resume = Arc::clone(&self.control.resume);
        Box::pin(async_stream::stream! {
            for (i, message) in messages.into_iter().enumerate() {
                if pause_after == Some(i) {
                    resume.notified().await;
                }
                yield Ok(message);
            }
            if let Some(error) = failure {
                yield Err(error);
            }
        })
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

/// A streamed assistant reply: message start, one text delta, and the
/// structured message carrying the same text.
pub fn text_reply(text: &str) -> Vec<AgentMessage> {
    vec![
        AgentMessage::StreamDelta(StreamDelta::MessageStart),
        AgentMessage::StreamDelta(StreamDelta::TextDelta(text.to_string())),
        assistant(vec![ContentBlock::Text {
            text: text.to_string(),
        }]),
    ]
}

pub fn assistant(blocks: Vec<ContentBlock>) -> AgentMessage {
    AgentMessage::Structured(StructuredMessage {
        role: MessageRole::Assistant,
        model: Some("claude-sonnet-4-5".to_string()),
        parent_tool_use_id: None,
        blocks,
    })
}

pub fn tool_use(id: &str, name: &str, input: Option<Value>) -> AgentMessage {
    assistant(vec![ContentBlock::ToolUse {
        id: Some(id.to_string()),
        name: Some(name.to_string()),
        input,
    }])
}

pub fn tool_result(id: &str, content: Value) -> AgentMessage {
    AgentMessage::Structured(StructuredMessage {
        role: MessageRole::User,
        model: None,
        parent_tool_use_id: None,
        blocks: vec![ContentBlock::ToolResult {
            tool_use_id: Some(id.to_string()),
            content: Some(content),
            is_error: false,
        }],
    })
}

pub fn system_init(session_id: &str) -> AgentMessage {
    AgentMessage::System(SystemMessage {
        subtype: "init".to_string(),
        session_id: Some(session_id.to_string()),
        text: None,
    })
}

pub fn result(num_turns: u32) -> AgentMessage {
    AgentMessage::Result(ResultMessage {
        subtype: "success".to_string(),
        duration_ms: Some(1200),
        num_turns: Some(num_turns),
        total_cost_usd: Some(0.01),
        usage: Some(json!({"input_tokens": 10, "output_tokens": 5})),
        result: Some("done".to_string()),
        ..ResultMessage::default()
    })
}

// ---------------------------------------------------------------------------
// Event assertions
// ---------------------------------------------------------------------------

pub async fn collect_events(stream: impl Stream<Item = ProtocolEvent>) -> Vec<ProtocolEvent> {
    stream.collect().await
}

pub fn kinds(events: &[ProtocolEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.wire_name()).collect()
}

/// Raw `system_log` messages in order.
pub fn system_logs(events: &[ProtocolEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Raw { event } if event["type"] == "system_log" => {
                event["message"].as_str().map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

/// Every tool-call start has exactly one end after it, and text spans
/// never overlap.
pub fn assert_spans_paired(events: &[ProtocolEvent]) {
    let mut open_text: Option<&str> = None;
    let mut open_tools: HashSet<&str> = HashSet::new();
    let mut closed_tools: HashSet<&str> = HashSet::new();

    for event in events {
        match &event.kind {
            EventKind::TextMessageStart { message_id, .. } => {
                assert!(
                    open_text.is_none(),
                    "text span {message_id} started while {open_text:?} is open"
                );
                open_text = Some(message_id.as_str());
            }
            EventKind::TextMessageContent { message_id, .. } => {
                assert_eq!(open_text, Some(message_id.as_str()), "content outside its span");
            }
            EventKind::TextMessageEnd { message_id } => {
                assert_eq!(open_text, Some(message_id.as_str()), "end of unopened span");
                open_text = None;
            }
            EventKind::ToolCallStart { tool_call_id, .. } => {
                assert!(
                    open_tools.insert(tool_call_id.as_str()) && !closed_tools.contains(tool_call_id.as_str()),
                    "tool call {tool_call_id} started twice"
                );
            }
            EventKind::ToolCallArgs { tool_call_id, .. } => {
                assert!(open_tools.contains(tool_call_id.as_str()), "args for closed tool call");
            }
            EventKind::ToolCallEnd { tool_call_id, .. } => {
                assert!(
                    open_tools.remove(tool_call_id.as_str()),
                    "tool call {tool_call_id} ended without being open"
                );
                closed_tools.insert(tool_call_id.as_str());
            }
            _ => {}
        }
    }

    assert!(open_text.is_none(), "text span left open: {open_text:?}");
    assert!(open_tools.is_empty(), "tool calls left open: {open_tools:?}");
}

/// Exactly one terminal event, and it is the last one.
pub fn assert_single_terminal(events: &[ProtocolEvent]) {
    let terminals = events.iter().filter(|e| e.kind.is_terminal()).count();
    assert_eq!(terminals, 1, "expected one terminal event in {:?}", kinds(events));
    assert!(
        events.last().is_some_and(|e| e.kind.is_terminal()),
        "terminal event is not last in {:?}",
        kinds(events)
    );
}

// ---------------------------------------------------------------------------
// Fake claude binary
// ---------------------------------------------------------------------------

/// Write an executable `/bin/sh` script named `claude` into `dir`.
pub fn write_fake_claude(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write fake claude");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make fake claude executable");
    }

    path
}
