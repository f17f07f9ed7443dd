//! Per-run turn and usage bookkeeping.
//!
//! [`TurnTracker`] accumulates token usage and tool activity for one run and
//! forwards each lifecycle step to an [`ObservabilitySink`]. Sink failures
//! are logged and swallowed; they never abort a run.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Export target for run telemetry.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn initialize(&self, prompt: &str, namespace: &str, model: &str) -> Result<()>;

    async fn start_turn(&self, model: &str, user_input: &str) -> Result<()>;

    async fn track_tool_use(&self, name: &str, id: &str, input: &Value) -> Result<()>;

    async fn track_tool_result(
        &self,
        id: Option<&str>,
        content: Option<&Value>,
        is_error: bool,
    ) -> Result<()>;

    /// `output` is the assistant text observed during the turn.
    async fn end_turn(&self, turn_count: u32, output: &str, usage: Option<&Value>) -> Result<()>;

    async fn finalize(&self) -> Result<()>;

    async fn cleanup_on_error(&self, error: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl ObservabilitySink for NoopSink {
    async fn initialize(&self, _prompt: &str, _namespace: &str, _model: &str) -> Result<()> {
        Ok(())
    }

    async fn start_turn(&self, _model: &str, _user_input: &str) -> Result<()> {
        Ok(())
    }

    async fn track_tool_use(&self, _name: &str, _id: &str, _input: &Value) -> Result<()> {
        Ok(())
    }

    async fn track_tool_result(
        &self,
        _id: Option<&str>,
        _content: Option<&Value>,
        _is_error: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn end_turn(&self, _turn_count: u32, _output: &str, _usage: Option<&Value>) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_on_error(&self, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Sink that emits structured `tracing` records under the `relay::obs`
/// target.
#[derive(Debug, Clone)]
pub struct TracingSink {
    session_id: String,
    user: UserContext,
}

impl TracingSink {
    pub fn new(session_id: impl Into<String>, user: UserContext) -> Self {
        Self {
            session_id: session_id.into(),
            user,
        }
    }
}

#[async_trait]
impl ObservabilitySink for TracingSink {
    async fn initialize(&self, prompt: &str, namespace: &str, model: &str) -> Result<()> {
        info!(
            target: "relay::obs",
            session_id = %self.session_id,
            user_id = %self.user.user_id,
            user_name = %self.user.user_name,
            namespace,
            model,
            prompt_len = prompt.len(),
            "run initialized"
        );
        Ok(())
    }

    async fn start_turn(&self, model: &str, user_input: &str) -> Result<()> {
        info!(target: "relay::obs", session_id = %self.session_id, model, input_len = user_input.len(), "turn started");
        Ok(())
    }

    async fn track_tool_use(&self, name: &str, id: &str, _input: &Value) -> Result<()> {
        info!(target: "relay::obs", session_id = %self.session_id, tool = name, tool_call_id = id, "tool use");
        Ok(())
    }

    async fn track_tool_result(
        &self,
        id: Option<&str>,
        _content: Option<&Value>,
        is_error: bool,
    ) -> Result<()> {
        info!(target: "relay::obs", session_id = %self.session_id, tool_call_id = ?id, is_error, "tool result");
        Ok(())
    }

    async fn end_turn(&self, turn_count: u32, output: &str, usage: Option<&Value>) -> Result<()> {
        info!(
            target: "relay::obs",
            session_id = %self.session_id,
            turn_count,
            output_len = output.len(),
            usage = ?usage,
            "turn ended"
        );
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        info!(target: "relay::obs", session_id = %self.session_id, "run finalized");
        Ok(())
    }

    async fn cleanup_on_error(&self, error: &str) -> Result<()> {
        warn!(target: "relay::obs", session_id = %self.session_id, error, "run failed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// User context
// ---------------------------------------------------------------------------

const MAX_USER_FIELD_CHARS: usize = 255;

/// Identity attached to exported telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub user_name: String,
}

impl UserContext {
    /// Build a context from untrusted input.
    ///
    /// Both fields are trimmed and truncated to 255 characters. Ids keep
    /// only `[A-Za-z0-9@._-]`; names drop C0/C1 control characters.
    pub fn sanitized(user_id: &str, user_name: &str) -> Self {
        let user_id = user_id
            .trim()
            .chars()
            .take(MAX_USER_FIELD_CHARS)
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-'))
            .collect();
        let user_name = user_name
            .trim()
            .chars()
            .take(MAX_USER_FIELD_CHARS)
            .filter(|c| !matches!(*c as u32, 0x00..=0x1f | 0x7f..=0x9f))
            .collect();
        Self { user_id, user_name }
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Running totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_cost_usd: f64,
    pub turns_completed: u32,
    pub tool_uses: u32,
    pub tool_results: u32,
    pub tool_errors: u32,
}

impl UsageSummary {
    /// Add the token counts from an Anthropic `usage` object.
    pub fn record_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        self.input_tokens += field("input_tokens");
        self.output_tokens += field("output_tokens");
        self.cache_read_input_tokens += field("cache_read_input_tokens");
        self.cache_creation_input_tokens += field("cache_creation_input_tokens");
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Turn bookkeeping for a single run.
pub struct TurnTracker {
    sink: Arc<dyn ObservabilitySink>,
    model: String,
    prompt: String,
    turn_open: bool,
    turn_output: String,
    usage: UsageSummary,
}

fn report(op: &'static str, result: Result<()>) {
    if let Err(e) = result {
        warn!(op, error = %e, "observability sink failed");
    }
}

impl TurnTracker {
    pub fn new(
        sink: Arc<dyn ObservabilitySink>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            model: model.into(),
            prompt: prompt.into(),
            turn_open: false,
            turn_output: String::new(),
            usage: UsageSummary::default(),
        }
    }

    pub async fn initialize(&self, namespace: &str) {
        report(
            "initialize",
            self.sink.initialize(&self.prompt, namespace, &self.model).await,
        );
    }

    /// Note an assistant message. Opens a turn if none is open.
    pub async fn start_turn(&mut self, assistant_text: &str) {
        if !self.turn_open {
            self.turn_open = true;
            self.turn_output.clear();
            report(
                "start_turn",
                self.sink.start_turn(&self.model, &self.prompt).await,
            );
        }
        self.turn_output.push_str(assistant_text);
    }

    pub async fn track_tool_use(&mut self, name: &str, id: &str, input: &Value) {
        self.usage.tool_uses += 1;
        report(
            "track_tool_use",
            self.sink.track_tool_use(name, id, input).await,
        );
    }

    pub async fn track_tool_result(&mut self, id: Option<&str>, content: Option<&Value>, is_error: bool) {
        self.usage.tool_results += 1;
        if is_error {
            self.usage.tool_errors += 1;
        }
        report(
            "track_tool_result",
            self.sink.track_tool_result(id, content, is_error).await,
        );
    }

    /// Close the open turn, if any, and fold in the reported usage.
    pub async fn end_turn(&mut self, turn_count: u32, usage: Option<&Value>, cost_usd: Option<f64>) {
        if let Some(usage) = usage {
            self.usage.record_usage(usage);
        }
        if let Some(cost) = cost_usd {
            self.usage.total_cost_usd += cost;
        }
        if !self.turn_open {
            return;
        }
        self.turn_open = false;
        self.usage.turns_completed += 1;
        report(
            "end_turn",
            self.sink.end_turn(turn_count, &self.turn_output, usage).await,
        );
    }

    pub async fn finalize(&self) {
        info!(
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            tool_uses = self.usage.tool_uses,
            cost_usd = self.usage.total_cost_usd,
            "run usage"
        );
        report("finalize", self.sink.finalize().await);
    }

    pub async fn cleanup_on_error(&self, error: &(dyn Display + Sync)) {
        report(
            "cleanup_on_error",
            self.sink.cleanup_on_error(&error.to_string()).await,
        );
    }

    pub fn usage(&self) -> &UsageSummary {
        &self.usage
    }

    pub fn turn_open(&self) -> bool {
        self.turn_open
    }
}
