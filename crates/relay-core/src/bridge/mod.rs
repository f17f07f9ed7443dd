//! Agent process bridge.
//!
//! The bridge owns one external assistant process per run. The controller
//! drives it through three traits:
//!
//! ```text
//! AgentBridge --start(spec)--> Box<dyn AgentProcess>
//!                                  |
//!                                  |  control() --> Arc<dyn ProcessControl>  (interrupt handle)
//!                                  |  query(prompt)
//!                                  |  receive()  --> Stream<Result<AgentMessage>>
//!                                  |  stop()
//! ```
//!
//! [`start_with_fallback`] layers the continuation retry on top of any
//! bridge implementation.

pub mod auth;
pub mod claude_code;
pub mod messages;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tracing::{info, warn};

pub use auth::{AuthError, AuthMode, DEFAULT_MODEL, map_to_vertex_model, resolve_auth};
pub use claude_code::ClaudeCodeBridge;
pub use messages::{
    AgentMessage, ContentBlock, MessageRole, ResultMessage, StreamDelta, StructuredMessage,
    SystemMessage,
};

/// Tools the agent may use without prompting.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Bash",
    "Glob",
    "Grep",
    "Edit",
    "MultiEdit",
    "WebSearch",
];

/// Everything needed to launch the agent for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub working_dir: PathBuf,
    pub extra_dirs: Vec<PathBuf>,
    /// Resume the agent's own retained conversation state.
    pub continue_conversation: bool,
    /// Explicit model id; `None` leaves the agent's default in place.
    pub model: Option<String>,
    /// Variables added to the inherited environment.
    pub env: HashMap<String, String>,
    /// Variables removed from the inherited environment.
    pub env_remove: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_config: Option<PathBuf>,
    pub system_prompt: Option<String>,
}

/// Failures raised by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("no conversation found to continue")]
    NoConversation,
    #[error("failed to spawn agent binary '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process exited ({status}): {stderr}")]
    ProcessExited { status: String, stderr: String },
    #[error("agent process is not running")]
    NotRunning,
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the agent refused to continue because it had no prior
    /// conversation to resume.
    pub fn is_missing_conversation(&self) -> bool {
        match self {
            Self::NoConversation => true,
            Self::ProcessExited { stderr, .. } => {
                stderr.to_lowercase().contains("no conversation found")
            }
            _ => false,
        }
    }
}

pub type AgentMessageStream<'a> =
    Pin<Box<dyn Stream<Item = Result<AgentMessage, BridgeError>> + Send + 'a>>;

/// Launches agent processes.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Human-readable name (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Launch and connect an agent process.
    ///
    /// Returns once the process is ready to accept a prompt.
    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, BridgeError>;
}

/// A connected agent process.
#[async_trait]
pub trait AgentProcess: Send {
    /// Cloneable interrupt handle, valid while the process lives.
    fn control(&self) -> Arc<dyn ProcessControl>;

    /// Send the prompt for this run.
    async fn query(&mut self, prompt: &str) -> Result<(), BridgeError>;

    /// Messages in emission order until the process signals completion.
    fn receive(&mut self) -> AgentMessageStream<'_>;

    /// Disconnect and reap the process. Called exactly once per run.
    async fn stop(&mut self) -> Result<(), BridgeError>;
}

/// Out-of-band control of a running process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn interrupt(&self) -> Result<(), BridgeError>;
}

// Compile-time assertion: the bridge traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentBridge, _: &dyn AgentProcess, _: &dyn ProcessControl) {}
};

// ---------------------------------------------------------------------------
// Continuation fallback
// ---------------------------------------------------------------------------

/// Result of [`start_with_fallback`].
pub struct Started {
    pub process: Box<dyn AgentProcess>,
    /// `true` when continuation was requested but the process was started
    /// fresh instead.
    pub fell_back: bool,
}

/// Start the agent, retrying once without continuation when the agent has
/// no conversation to resume. Any other failure propagates.
pub async fn start_with_fallback(
    bridge: &dyn AgentBridge,
    spec: &LaunchSpec,
) -> Result<Started, BridgeError> {
    match bridge.start(spec).await {
        Ok(process) => Ok(Started {
            process,
            fell_back: false,
        }),
        Err(e) if spec.continue_conversation && e.is_missing_conversation() => {
            warn!(bridge = bridge.name(), error = %e, "conversation continuation failed, starting fresh");
            let fresh = LaunchSpec {
                continue_conversation: false,
                ..spec.clone()
            };
            let process = bridge.start(&fresh).await?;
            info!(bridge = bridge.name(), "agent started without continuation");
            Ok(Started {
                process,
                fell_back: true,
            })
        }
        Err(e) => Err(e),
    }
}
