//! Claude Code bridge.
//!
//! Spawns `claude --input-format stream-json --output-format stream-json`
//! as a long-lived subprocess, speaks the stream-json control protocol on
//! stdin, and parses its JSONL stdout into [`AgentMessage`] values.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{AgentMessage, StreamLine, parse_stream_json_line};
use super::{AgentBridge, AgentMessageStream, AgentProcess, BridgeError, LaunchSpec, ProcessControl};

/// How long a connecting process may stay silent before we give up.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period after closing stdin before signalling the process.
const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Grace period after SIGTERM before SIGKILL.
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
/// Bytes of stderr retained for error reports.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Bridge for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Debug, Clone)]
pub struct ClaudeCodeBridge {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    claude_binary_path: String,
    connect_timeout: Duration,
}

impl ClaudeCodeBridge {
    /// Create a bridge that will look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Create a bridge with a custom binary path.
    ///
    /// Useful for testing or when `claude` is installed in a non-standard
    /// location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            claude_binary_path: path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn binary_path(&self) -> &str {
        &self.claude_binary_path
    }
}

impl Default for ClaudeCodeBridge {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Command-line arguments for a launch.
pub fn launch_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
        "--permission-mode",
        "acceptEdits",
        "--setting-sources",
        "project",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if !spec.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(spec.allowed_tools.join(","));
    }
    if spec.continue_conversation {
        args.push("--continue".to_string());
    }
    if let Some(model) = &spec.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    for dir in &spec.extra_dirs {
        args.push("--add-dir".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(mcp) = &spec.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(mcp.to_string_lossy().into_owned());
    }
    if let Some(prompt) = &spec.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    args
}

fn control_request(subtype: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": format!("req_{}", Uuid::new_v4().simple()),
        "request": { "subtype": subtype },
    })
}

fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
        "parent_tool_use_id": null,
        "session_id": "default",
    })
}

async fn write_line(stdin: &Mutex<Option<ChildStdin>>, value: &Value) -> Result<(), BridgeError> {
    let mut guard = stdin.lock().await;
    let pipe = guard.as_mut().ok_or(BridgeError::NotRunning)?;
    let mut line = serde_json::to_string(value)
        .map_err(|e| BridgeError::Protocol(format!("failed to encode request: {e}")))?;
    line.push('\n');
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await?;
    Ok(())
}

/// Drain stderr into a bounded tail buffer, logging each line.
fn spawn_stderr_collector(
    stderr: ChildStderr,
    tail: Arc<std::sync::Mutex<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(line = %line, "agent stderr");
            let mut buf = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            buf.push_str(&line);
            buf.push('\n');
            if buf.len() > STDERR_TAIL_BYTES {
                let mut cut = buf.len() - STDERR_TAIL_BYTES;
                while !buf.is_char_boundary(cut) {
                    cut += 1;
                }
                buf.drain(..cut);
            }
        }
    })
}

fn read_tail(tail: &std::sync::Mutex<String>) -> String {
    tail.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .trim()
        .to_string()
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> bool {
    // SAFETY: pid is a valid u32 from a child we spawned and have not reaped.
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

// ---------------------------------------------------------------------------
// AgentBridge implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AgentBridge for ClaudeCodeBridge {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, BridgeError> {
        let mut cmd = Command::new(&self.claude_binary_path);
        cmd.args(launch_args(spec));
        cmd.current_dir(&spec.working_dir);

        // Merge into the inherited environment rather than replacing it.
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            binary: self.claude_binary_path.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Protocol("agent stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Protocol("agent stdout was not piped".to_string()))?;
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));
        let collector = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_collector(stderr, Arc::clone(&stderr_tail)));

        info!(
            pid = ?pid,
            cwd = %spec.working_dir.display(),
            continue_conversation = spec.continue_conversation,
            "spawned claude process"
        );

        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let mut lines = BufReader::new(stdout).lines();

        // A failed write means the process already exited; the read below
        // observes EOF and reports why.
        if let Err(e) = write_line(&stdin, &control_request("initialize")).await {
            debug!(error = %e, "failed to send initialize request");
        }

        let first = tokio::time::timeout(self.connect_timeout, lines.next_line()).await;
        let pending = match first {
            Ok(Ok(Some(line))) => Some(line),
            Ok(Ok(None)) => {
                let status = match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "unknown status".to_string(),
                };
                // stderr closes with the process; wait for the collector to drain it.
                if let Some(collector) = collector {
                    let _ = tokio::time::timeout(Duration::from_secs(1), collector).await;
                }
                let stderr = read_tail(&stderr_tail);
                warn!(status = %status, stderr = %stderr, "claude exited before connecting");
                let err = BridgeError::ProcessExited { status, stderr };
                return Err(if err.is_missing_conversation() {
                    BridgeError::NoConversation
                } else {
                    err
                });
            }
            Ok(Err(e)) => return Err(BridgeError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(BridgeError::Protocol(format!(
                    "claude did not respond within {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };

        debug!(pid = ?pid, "claude connected");

        Ok(Box::new(ClaudeCodeProcess {
            pid,
            child,
            stdin,
            lines,
            pending,
            stderr_tail,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connected process
// ---------------------------------------------------------------------------

struct ClaudeCodeProcess {
    pid: Option<u32>,
    child: Child,
    /// Shared with [`ClaudeCodeControl`]; `None` once stdin is closed.
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    lines: Lines<BufReader<ChildStdout>>,
    /// Line read while waiting for the connection, not yet delivered.
    pending: Option<String>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl AgentProcess for ClaudeCodeProcess {
    fn control(&self) -> Arc<dyn ProcessControl> {
        Arc::new(ClaudeCodeControl {
            pid: self.pid,
            stdin: Arc::clone(&self.stdin),
            alive: Arc::clone(&self.alive),
        })
    }

    async fn query(&mut self, prompt: &str) -> Result<(), BridgeError> {
        debug!(pid = ?self.pid, prompt_len = prompt.len(), "sending prompt");
        write_line(&self.stdin, &user_message(prompt)).await
    }

    fn receive(&mut self) -> AgentMessageStream<'_> {
        let pending = self.pending.take();
        let lines = &mut self.lines;
        let child = &mut self.child;
        let stderr_tail = Arc::clone(&self.stderr_tail);
        let pid = self.pid;

        let stream = async_stream::stream! {
            let mut next = pending;
            loop {
                let line = match next.take() {
                    Some(line) => line,
                    None => match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(pid = ?pid, error = %e, "error reading claude stdout");
                            yield Err(BridgeError::Io(e));
                            return;
                        }
                    },
                };

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_stream_json_line(trimmed) {
                    Ok(StreamLine::Message(message)) => {
                        let done = matches!(message, AgentMessage::Result(_));
                        yield Ok(message);
                        if done {
                            return;
                        }
                    }
                    Ok(StreamLine::ControlResponse { request_id, error: Some(error) }) => {
                        warn!(request_id = ?request_id, error = %error, "claude rejected control request");
                    }
                    Ok(StreamLine::ControlResponse { .. }) | Ok(StreamLine::Ignored) => {}
                    Err(e) => {
                        warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                    }
                }
            }

            // EOF before a result message: the process died mid-run.
            let status = match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
                Ok(Ok(status)) => status.to_string(),
                _ => "unknown status".to_string(),
            };
            yield Err(BridgeError::ProcessExited {
                status,
                stderr: read_tail(&stderr_tail),
            });
        };

        Box::pin(stream)
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        self.alive.store(false, Ordering::SeqCst);
        // Closing stdin ends the session; the CLI exits on its own.
        drop(self.stdin.lock().await.take());

        if let Ok(Ok(status)) = tokio::time::timeout(STDIN_CLOSE_GRACE, self.child.wait()).await {
            debug!(pid = ?self.pid, status = %status, "claude exited after stdin closed");
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                if !send_signal(pid, libc::SIGTERM) {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }
        }

        match tokio::time::timeout(SIGTERM_GRACE, self.child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(pid = ?self.pid, "claude exited after SIGTERM");
            }
            _ => {
                debug!(pid = ?self.pid, "claude did not exit after SIGTERM, sending SIGKILL");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Interrupt handle for a running Claude Code process.
struct ClaudeCodeControl {
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessControl for ClaudeCodeControl {
    async fn interrupt(&self) -> Result<(), BridgeError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::NotRunning);
        }

        match write_line(&self.stdin, &control_request("interrupt")).await {
            Ok(()) => {
                info!(pid = ?self.pid, "interrupt request sent to claude");
                Ok(())
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "interrupt request failed, falling back to SIGINT");
                #[cfg(unix)]
                {
                    if let Some(pid) = self.pid {
                        if send_signal(pid, libc::SIGINT) {
                            return Ok(());
                        }
                    }
                }
                Err(e)
            }
        }
    }
}
