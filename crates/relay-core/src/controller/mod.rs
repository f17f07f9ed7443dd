//! Run controller: one conversational turn in, one protocol event sequence
//! out.
//!
//! [`RunController::process_run`] returns a lazy stream. Every sequence
//! starts with `RUN_STARTED` and ends with exactly one of `RUN_FINISHED` or
//! `RUN_ERROR`. Failures anywhere in between are caught here, recorded on the
//! session as a status code, and surfaced as the terminal `RUN_ERROR`.
//!
//! Runs on one controller are serialized: a run holds the controller's run
//! slot from its first event until its stream ends or is dropped.

pub mod prerequisites;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_stream::{stream, try_stream};
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::{error, info, warn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::bridge::{
    AgentBridge, AuthError, BridgeError, DEFAULT_ALLOWED_TOOLS, DEFAULT_MODEL, LaunchSpec,
    resolve_auth, start_with_fallback,
};
use crate::credentials::{CredentialProvider, NoCredentials, credential_env, fetch_all};
use crate::events::{EventFactory, EventKind, ProtocolEvent, Role};
use crate::normalize::{InputMessage, RunRequest};
use crate::session::{InterruptOutcome, ProcessLease, RunOutcome, RunSession};
use crate::tracker::{NoopSink, ObservabilitySink, TurnTracker};
use crate::translator::{EventTranslator, PROCESSING_STEP};
use crate::workspace::{
    WorkspaceLayout, ensure_working_dir, load_ambient_config, load_mcp_servers, resolve,
    workspace_context_prompt,
};

pub use prerequisites::{PrerequisiteError, validate_prerequisites};

/// Lazy protocol event sequence for one run.
pub type EventStream = Pin<Box<dyn Stream<Item = ProtocolEvent> + Send>>;

type BodyStream = Pin<Box<dyn Stream<Item = Result<ProtocolEvent, RunFailure>> + Send>>;

const NO_USER_MESSAGE: &str = "No user message provided";
const CONTINUING_NOTICE: &str = "Continuing conversation from previous state";
const FALLBACK_NOTICE: &str = "Could not continue conversation, starting fresh...";
const ABANDONED: &str = "Run abandoned before completion";

/// Returned by [`RunController::try_process_run`] while another run holds
/// the run slot.
#[derive(Debug, thiserror::Error)]
#[error("a run is already in progress")]
pub struct RunInProgress;

/// Why a run ended in `RUN_ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error(transparent)]
    Prerequisite(#[from] PrerequisiteError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl RunFailure {
    fn outcome(&self) -> RunOutcome {
        let message = self.to_string();
        match self {
            Self::Prerequisite(_) => RunOutcome::MissingPrerequisite { message },
            _ => RunOutcome::Failed { message },
        }
    }
}

/// Static configuration of the adapter process.
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    pub session_id: String,
    /// Namespace reported to observability.
    pub namespace: String,
    /// Explicitly configured model; also controls whether `--model` is
    /// passed to the agent.
    pub model: Option<String>,
    /// Treat the first run as a continuation (restarted session).
    pub is_resume: bool,
    pub mcp_config: Option<PathBuf>,
    /// Authentication variables (`ANTHROPIC_API_KEY`,
    /// `CLAUDE_CODE_USE_VERTEX`, ...) as seen at startup.
    pub auth_env: HashMap<String, String>,
}

/// External collaborators consulted during a run.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialProvider>,
    pub observability: Arc<dyn ObservabilitySink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            credentials: Arc::new(NoCredentials),
            observability: Arc::new(NoopSink),
        }
    }
}

pub struct RunController {
    settings: RunnerSettings,
    bridge: Arc<dyn AgentBridge>,
    collaborators: Collaborators,
    session: Arc<RunSession>,
    workspace: Mutex<WorkspaceLayout>,
    run_slot: Arc<AsyncMutex<()>>,
}

impl RunController {
    pub fn new(
        settings: RunnerSettings,
        workspace: WorkspaceLayout,
        bridge: Arc<dyn AgentBridge>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            settings,
            bridge,
            collaborators,
            session: Arc::new(RunSession::new()),
            workspace: Mutex::new(workspace),
            run_slot: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<RunSession> {
        &self.session
    }

    pub fn workspace(&self) -> WorkspaceLayout {
        self.workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the workspace layout used by subsequent runs.
    pub fn set_workspace(&self, layout: WorkspaceLayout) {
        *self.workspace.lock().unwrap_or_else(PoisonError::into_inner) = layout;
    }

    /// Start the next run without continuation.
    pub fn reset_conversation(&self) {
        self.session.reset_conversation();
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.session.last_outcome()
    }

    /// Interrupt the process of the run currently in flight.
    ///
    /// With no active process this is a logged no-op.
    pub async fn interrupt(&self) -> Result<InterruptOutcome, BridgeError> {
        let Some(control) = self.session.active_process() else {
            warn!("interrupt requested but no active process");
            return Ok(InterruptOutcome::NoActiveProcess);
        };
        info!("sending interrupt to agent process");
        control.interrupt().await?;
        info!("interrupt sent");
        Ok(InterruptOutcome::Sent)
    }

    /// Whether a run currently holds the run slot.
    pub fn is_busy(&self) -> bool {
        self.run_slot.try_lock().is_err()
    }

    /// Run one turn and stream its protocol events.
    ///
    /// If another run is in flight, the stream waits for it to end before
    /// producing `RUN_STARTED`.
    pub fn process_run(self: &Arc<Self>, request: RunRequest) -> EventStream {
        let controller = Arc::clone(self);
        Box::pin(stream! {
            let slot = Arc::clone(&controller.run_slot).lock_owned().await;
            let mut events = controller.run_events(request, slot);
            while let Some(event) = events.next().await {
                yield event;
            }
        })
    }

    /// Like [`process_run`](Self::process_run), but fails immediately
    /// instead of waiting when another run is in flight.
    pub fn try_process_run(self: &Arc<Self>, request: RunRequest) -> Result<EventStream, RunInProgress> {
        let slot = Arc::clone(&self.run_slot)
            .try_lock_owned()
            .map_err(|_| RunInProgress)?;
        Ok(Arc::clone(self).run_events(request, slot))
    }

    fn run_events(self: Arc<Self>, request: RunRequest, slot: OwnedMutexGuard<()>) -> EventStream {
        let controller = self;
        let factory = EventFactory::new(request.thread_id.clone(), request.run_id.clone());

        Box::pin(stream! {
            let _slot = slot;
            let mut pending = PendingOutcome::new(Arc::clone(&controller.session));
            controller.session.begin_run(factory.thread_id(), factory.run_id());
            info!(
                thread_id = %factory.thread_id(),
                run_id = %factory.run_id(),
                messages = request.messages.len(),
                "run started"
            );
            yield factory.run_started();

            let mut body = Arc::clone(&controller).run_body(request, factory.clone());
            let mut failure = None;
            while let Some(item) = body.next().await {
                match item {
                    Ok(event) => yield event,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(body);

            match failure {
                None => {
                    pending.settle(RunOutcome::Succeeded);
                    info!(run_id = %factory.run_id(), "run finished");
                    yield factory.run_finished();
                }
                Some(failure) => {
                    let outcome = failure.outcome();
                    error!(
                        run_id = %factory.run_id(),
                        status = outcome.status_code(),
                        error = %failure,
                        "run failed"
                    );
                    pending.settle(outcome);
                    yield factory.run_error(failure.to_string(), None);
                }
            }
        })
    }

    /// Everything between `RUN_STARTED` and the terminal event.
    fn run_body(self: Arc<Self>, request: RunRequest, factory: EventFactory) -> BodyStream {
        Box::pin(try_stream! {
            let layout = self.workspace();
            let prompt = request.latest_user_prompt();
            if let Some(prompt) = &prompt {
                validate_prerequisites(prompt, &layout.root).await?;
            }

            for event in echo_user_messages(&factory, &request.messages) {
                yield event;
            }

            let prompt = match prompt {
                Some(prompt) => prompt,
                None => {
                    warn!(run_id = %factory.run_id(), "no user message in request");
                    yield factory.system_log(NO_USER_MESSAGE);
                    return;
                }
            };

            let auth = resolve_auth(|key| self.settings.auth_env.get(key).cloned())?;
            let configured_model = match &self.settings.model {
                Some(model) => auth.model_id(model),
                None => DEFAULT_MODEL.to_string(),
            };

            let active_workflow = layout.active_workflow.is_some();
            let paths = ensure_working_dir(resolve(&layout), &layout.root).await;
            info!(
                cwd = %paths.working_dir.display(),
                extra_dirs = ?paths.extra_dirs,
                "workspace resolved"
            );

            let mut env = credential_env(&fetch_all(self.collaborators.credentials.as_ref()).await);
            let env_remove = auth.apply(&mut env).into_iter().map(str::to_string).collect();

            let mut allowed_tools: Vec<String> =
                DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect();
            let mut mcp_config = None;
            if let Some(path) = &self.settings.mcp_config {
                if let Some(servers) = load_mcp_servers(path).await.filter(|s| !s.is_empty()) {
                    info!(servers = ?servers.keys().collect::<Vec<_>>(), "MCP tool permissions granted");
                    allowed_tools.extend(servers.keys().map(|name| format!("mcp__{name}")));
                    mcp_config = Some(path.clone());
                }
            }

            let ambient = if active_workflow {
                load_ambient_config(&paths.working_dir).await
            } else {
                Default::default()
            };
            let system_prompt = workspace_context_prompt(
                &layout,
                paths.workflow_name.as_deref().filter(|_| active_workflow),
                &ambient,
            );

            let mut tracker = TurnTracker::new(
                Arc::clone(&self.collaborators.observability),
                &configured_model,
                &prompt,
            );
            tracker.initialize(&self.settings.namespace).await;

            let continue_conversation = !self.session.is_first_run() || self.settings.is_resume;
            if continue_conversation {
                info!("continuing conversation from previous state");
                yield factory.system_log(CONTINUING_NOTICE);
            }

            let spec = LaunchSpec {
                working_dir: paths.working_dir.clone(),
                extra_dirs: paths.extra_dirs.clone(),
                continue_conversation,
                model: self.settings.model.as_ref().map(|m| auth.model_id(m)),
                env,
                env_remove,
                allowed_tools,
                mcp_config,
                system_prompt: Some(system_prompt),
            };

            let started = match start_with_fallback(self.bridge.as_ref(), &spec).await {
                Ok(started) => started,
                Err(e) => {
                    tracker.cleanup_on_error(&e).await;
                    Err(e)?
                }
            };
            if started.fell_back {
                yield factory.system_log(FALLBACK_NOTICE);
            }
            let mut lease = ProcessLease::acquire(Arc::clone(&self.session), started.process);
            self.session.mark_engaged();

            let step_id = Uuid::new_v4().to_string();
            yield factory.event(EventKind::StepStarted {
                step_id: step_id.clone(),
                step_name: PROCESSING_STEP.to_string(),
            });

            let mut translator = EventTranslator::new(factory.clone(), self.session.turn_count());
            let mut failure: Option<BridgeError> = None;
            let process = lease.process()?;
            match process.query(&prompt).await {
                Err(e) => failure = Some(e),
                Ok(()) => {
                    let mut messages = process.receive();
                    while let Some(item) = messages.next().await {
                        match item {
                            Ok(message) => {
                                for event in translator.translate(message, &mut tracker).await {
                                    yield event;
                                }
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                }
            }
            for event in translator.close_open_spans() {
                yield event;
            }

            lease.finish().await;
            self.session.complete_run(translator.turn_count());

            if let Some(e) = failure {
                tracker.cleanup_on_error(&e).await;
                Err::<(), BridgeError>(e)?;
            }

            yield factory.event(EventKind::StepFinished {
                step_id,
                step_name: PROCESSING_STEP.to_string(),
            });
            tracker.finalize().await;
        })
    }
}

/// Records the run's outcome on the session, falling back to a failure if
/// the run is dropped before it settles.
struct PendingOutcome {
    session: Arc<RunSession>,
    settled: bool,
}

impl PendingOutcome {
    fn new(session: Arc<RunSession>) -> Self {
        Self {
            session,
            settled: false,
        }
    }

    fn settle(&mut self, outcome: RunOutcome) {
        self.session.record_outcome(outcome);
        self.settled = true;
    }
}

impl Drop for PendingOutcome {
    fn drop(&mut self) {
        if !self.settled {
            warn!("run stream dropped before completion");
            self.session.record_outcome(RunOutcome::Failed {
                message: ABANDONED.to_string(),
            });
        }
    }
}

/// Replay the request's user messages as text spans.
fn echo_user_messages(factory: &EventFactory, messages: &[InputMessage]) -> Vec<ProtocolEvent> {
    let mut out = Vec::new();
    for message in messages.iter().filter(|m| m.is_user()) {
        let message_id = message
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if message.is_hidden() {
            info!(message_id = %message_id, "user message marked hidden");
            out.push(factory.raw(json!({
                "type": "message_metadata",
                "messageId": message_id,
                "metadata": message.metadata,
                "hidden": true,
            })));
        }

        out.push(factory.event(EventKind::TextMessageStart {
            message_id: message_id.clone(),
            role: Role::User,
        }));
        let text = message.display_text();
        if !text.is_empty() {
            out.push(factory.event(EventKind::TextMessageContent {
                message_id: message_id.clone(),
                delta: text,
            }));
        }
        out.push(factory.event(EventKind::TextMessageEnd { message_id }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::MessageContent;

    fn user(id: Option<&str>, text: &str, hidden: bool) -> InputMessage {
        InputMessage {
            id: id.map(str::to_string),
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
            metadata: hidden.then(|| json!({"hidden": true, "source": "workflow"})),
        }
    }

    #[test]
    fn echo_skips_non_user_messages() {
        let factory = EventFactory::new("t", "r");
        let assistant = InputMessage {
            id: Some("a".into()),
            role: "assistant".into(),
            content: MessageContent::Text("hi".into()),
            metadata: None,
        };
        let events = echo_user_messages(&factory, &[assistant, user(Some("u1"), "hello", false)]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind.wire_name()).collect();
        assert_eq!(
            kinds,
            vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT", "TEXT_MESSAGE_END"]
        );
        assert_eq!(
            events[1].kind,
            EventKind::TextMessageContent {
                message_id: "u1".into(),
                delta: "hello".into()
            }
        );
    }

    #[test]
    fn echo_hidden_message_emits_metadata_first() {
        let factory = EventFactory::new("t", "r");
        let events = echo_user_messages(&factory, &[user(Some("u1"), "auto prompt", true)]);
        let EventKind::Raw { event } = &events[0].kind else {
            panic!("expected raw metadata event");
        };
        assert_eq!(event["type"], "message_metadata");
        assert_eq!(event["messageId"], "u1");
        assert_eq!(event["hidden"], true);
        assert_eq!(event["metadata"]["source"], "workflow");
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn echo_empty_content_has_no_content_event() {
        let factory = EventFactory::new("t", "r");
        let events = echo_user_messages(&factory, &[user(None, "", false)]);
        assert_eq!(events.len(), 2);
        let EventKind::TextMessageStart { message_id, role } = &events[0].kind else {
            panic!("expected start");
        };
        assert_eq!(*role, Role::User);
        assert!(Uuid::parse_str(message_id).is_ok());
    }

    #[test]
    fn failure_outcomes_map_to_status_codes() {
        let prerequisite = RunFailure::Prerequisite(PrerequisiteError {
            command: "/speckit.plan",
            required_file: "spec.md",
            message: "missing",
        });
        assert_eq!(prerequisite.outcome().status_code(), 2);
        assert_eq!(
            RunFailure::Auth(AuthError::NotConfigured).outcome().status_code(),
            1
        );
        assert_eq!(
            RunFailure::Bridge(BridgeError::NotRunning).outcome().status_code(),
            1
        );
    }
}
