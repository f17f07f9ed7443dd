//! Adapter state that outlives individual runs.
//!
//! One [`RunSession`] exists per adapter process. It remembers the last run's
//! identifiers, the monotonic turn count, whether the agent has been engaged
//! yet (which governs continuation), and the interrupt handle of the process
//! currently in flight.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::bridge::{AgentProcess, BridgeError, ProcessControl};

/// How the most recent run ended, as recorded locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed { message: String },
    MissingPrerequisite { message: String },
}

impl RunOutcome {
    /// Status code surfaced to callers: 0 success, 1 generic failure,
    /// 2 missing prerequisite.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { .. } => 1,
            Self::MissingPrerequisite { .. } => 2,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { message } => write!(f, "failed: {message}"),
            Self::MissingPrerequisite { message } => {
                write!(f, "missing prerequisite: {message}")
            }
        }
    }
}

/// Result of an interrupt request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Sent,
    NoActiveProcess,
}

#[derive(Default)]
struct SessionState {
    thread_id: Option<String>,
    run_id: Option<String>,
    turn_count: u32,
    engaged: bool,
    active_process: Option<Arc<dyn ProcessControl>>,
    last_outcome: Option<RunOutcome>,
}

/// Long-lived adapter state shared by the controller and interrupt callers.
#[derive(Default)]
pub struct RunSession {
    state: Mutex<SessionState>,
}

impl RunSession {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning only happens if a holder panicked; the state is still usable.
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the identifiers of a run that is starting.
    pub fn begin_run(&self, thread_id: &str, run_id: &str) {
        let mut state = self.lock();
        state.thread_id = Some(thread_id.to_string());
        state.run_id = Some(run_id.to_string());
        debug!(thread_id, run_id, "run registered with session");
    }

    /// Make `handle` the target of [`interrupt`](crate::RunController::interrupt).
    pub fn register_process(&self, handle: Arc<dyn ProcessControl>) {
        self.lock().active_process = Some(handle);
    }

    /// Forget the active process handle only if it is `handle`.
    ///
    /// A run that ends after another run registered its own process leaves
    /// the newer registration in place.
    pub fn clear_process(&self, handle: &Arc<dyn ProcessControl>) {
        let mut state = self.lock();
        if state
            .active_process
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            state.active_process = None;
            debug!("active process cleared");
        }
    }

    /// Note that the agent was engaged, so the next run continues the
    /// conversation even if this one never completes.
    pub fn mark_engaged(&self) {
        self.lock().engaged = true;
    }

    /// Note that the agent was engaged for a run and fold in its turn count.
    ///
    /// The turn count never decreases.
    pub fn complete_run(&self, turn_count: u32) {
        let mut state = self.lock();
        state.engaged = true;
        if turn_count > state.turn_count {
            state.turn_count = turn_count;
        }
    }

    /// Start the next run without continuation, e.g. after the workspace
    /// layout changed.
    pub fn reset_conversation(&self) {
        let mut state = self.lock();
        if state.engaged {
            info!("conversation reset; next run starts fresh");
        }
        state.engaged = false;
    }

    pub fn record_outcome(&self, outcome: RunOutcome) {
        self.lock().last_outcome = Some(outcome);
    }

    pub fn thread_id(&self) -> Option<String> {
        self.lock().thread_id.clone()
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock().run_id.clone()
    }

    pub fn turn_count(&self) -> u32 {
        self.lock().turn_count
    }

    pub fn is_first_run(&self) -> bool {
        !self.lock().engaged
    }

    pub fn active_process(&self) -> Option<Arc<dyn ProcessControl>> {
        self.lock().active_process.clone()
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.lock().last_outcome.clone()
    }
}

/// Clears the session's active process when dropped, if it is still the
/// handle this guard registered.
pub(crate) struct ActiveProcessGuard {
    session: Arc<RunSession>,
    handle: Arc<dyn ProcessControl>,
}

impl ActiveProcessGuard {
    pub(crate) fn register(session: Arc<RunSession>, handle: Arc<dyn ProcessControl>) -> Self {
        session.register_process(Arc::clone(&handle));
        Self { session, handle }
    }
}

impl Drop for ActiveProcessGuard {
    fn drop(&mut self) {
        self.session.clear_process(&self.handle);
    }
}

/// Owns a run's agent process from start to stop.
///
/// The process is registered as the session's interrupt target for the
/// lease's lifetime. [`finish`](Self::finish) releases the registration and
/// awaits `stop()`. Dropping an unfinished lease, e.g. when the event stream
/// is abandoned mid-run, does the same with `stop()` on a spawned task.
pub(crate) struct ProcessLease {
    process: Option<Box<dyn AgentProcess>>,
    registration: Option<ActiveProcessGuard>,
}

impl ProcessLease {
    pub(crate) fn acquire(session: Arc<RunSession>, process: Box<dyn AgentProcess>) -> Self {
        let registration = ActiveProcessGuard::register(session, process.control());
        Self {
            process: Some(process),
            registration: Some(registration),
        }
    }

    pub(crate) fn process(&mut self) -> Result<&mut (dyn AgentProcess + 'static), BridgeError> {
        self.process.as_deref_mut().ok_or(BridgeError::NotRunning)
    }

    pub(crate) async fn finish(mut self) {
        drop(self.registration.take());
        if let Some(mut process) = self.process.take() {
            stop_process(process.as_mut()).await;
        }
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        drop(self.registration.take());
        let Some(mut process) = self.process.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                info!("run abandoned, stopping agent process in background");
                runtime.spawn(async move { stop_process(process.as_mut()).await });
            }
            Err(_) => warn!("run abandoned outside a runtime, agent process not stopped"),
        }
    }
}

async fn stop_process(process: &mut dyn AgentProcess) {
    if let Err(e) = process.stop().await {
        warn!(error = %e, "failed to stop agent process");
    }
}
