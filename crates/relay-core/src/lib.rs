//! Streams Claude Code agent runs as AG-UI protocol events.
//!
//! A run flows through the crate like this:
//!
//! ```text
//! JSON request --normalize--> RunRequest --RunController::process_run-->
//!     AgentBridge (claude subprocess) --AgentMessage--> EventTranslator
//!     --ProtocolEvent--> caller
//! ```

pub mod bridge;
pub mod controller;
pub mod credentials;
pub mod events;
pub mod normalize;
pub mod session;
pub mod tracker;
pub mod translator;
pub mod workspace;

pub use bridge::{AgentBridge, AgentProcess, BridgeError, ClaudeCodeBridge, LaunchSpec};
pub use controller::{
    Collaborators, EventStream, RunController, RunFailure, RunInProgress, RunnerSettings,
};
pub use events::{EventFactory, EventKind, ProtocolEvent, Role};
pub use normalize::{NormalizeError, RunRequest, normalize_run_request};
pub use session::{InterruptOutcome, RunOutcome, RunSession};
pub use translator::EventTranslator;
pub use workspace::{WorkspaceLayout, WorkspacePaths};
