//! `relay run` command: drive one turn locally and print its events as
//! JSON lines.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relay_core::{InterruptOutcome, RunController, RunOutcome, RunRequest, normalize_run_request};

/// Run the `run` command.
pub async fn run_once(controller: Arc<RunController>, prompt: &str) -> Result<RunOutcome> {
    let request = normalize_run_request(
        json!({
            "messages": [{ "id": Uuid::new_v4().to_string(), "role": "user", "content": prompt }],
        }),
        &controller.settings().session_id,
    )
    .context("failed to build run request")?;

    // First signal interrupts the agent, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nInterrupting agent (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    drive(&controller, request, cancel, &mut stdout).await
}

/// Stream one run into `out`, interrupting the agent once `cancel` fires.
pub async fn drive(
    controller: &Arc<RunController>,
    request: RunRequest,
    cancel: CancellationToken,
    out: &mut impl Write,
) -> Result<RunOutcome> {
    let mut events = controller.process_run(request);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                serde_json::to_writer(&mut *out, &event).context("failed to encode event")?;
                writeln!(out)?;
                out.flush()?;
            }
            _ = cancel.cancelled(), if !interrupted => {
                interrupted = true;
                match controller.interrupt().await {
                    Ok(InterruptOutcome::Sent) => info!("interrupt sent"),
                    Ok(InterruptOutcome::NoActiveProcess) => {}
                    Err(e) => warn!(error = %e, "interrupt failed"),
                }
            }
        }
    }

    Ok(controller.last_outcome().unwrap_or(RunOutcome::Succeeded))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;
    use tempfile::TempDir;

    use relay_core::workspace::WorkspaceLayout;
    use relay_core::{Collaborators, RunnerSettings};
    use relay_test_utils::{ScriptedBridge, result, text_reply};

    use super::*;

    fn controller(root: &TempDir, bridge: ScriptedBridge, auth: bool) -> Arc<RunController> {
        let auth_env = if auth {
            HashMap::from([("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string())])
        } else {
            HashMap::new()
        };
        Arc::new(RunController::new(
            RunnerSettings {
                session_id: "local".into(),
                auth_env,
                ..RunnerSettings::default()
            },
            WorkspaceLayout::new(root.path()),
            Arc::new(bridge),
            Collaborators::default(),
        ))
    }

    fn request(prompt: &str) -> RunRequest {
        normalize_run_request(
            json!({"messages": [{"role": "user", "content": prompt}]}),
            "local",
        )
        .unwrap()
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn prints_one_json_line_per_event() {
        let root = TempDir::new().unwrap();
        let mut script = text_reply("done");
        script.push(result(1));
        let controller = controller(&root, ScriptedBridge::new(script), true);

        let mut out = Vec::new();
        let outcome = drive(&controller, request("go"), CancellationToken::new(), &mut out)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Succeeded);
        let events = lines(&out);
        assert_eq!(events.first().unwrap()["type"], "RUN_STARTED");
        assert_eq!(events.first().unwrap()["threadId"], "local");
        assert_eq!(events.last().unwrap()["type"], "RUN_FINISHED");
    }

    #[tokio::test]
    async fn cancellation_interrupts_paused_agent() {
        let root = TempDir::new().unwrap();
        let mut script = text_reply("partial");
        script.push(result(1));
        let controller = controller(&root, ScriptedBridge::new(script).pause_after(1), true);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut out = Vec::new();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drive(&controller, request("long"), cancel, &mut out),
        )
        .await
        .expect("run should finish after interrupt")
        .unwrap();

        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(lines(&out).last().unwrap()["type"], "RUN_FINISHED");
    }

    #[tokio::test]
    async fn failed_run_reports_failure_outcome() {
        let root = TempDir::new().unwrap();
        let controller = controller(&root, ScriptedBridge::new(Vec::new()), false);

        let mut out = Vec::new();
        let outcome = drive(&controller, request("go"), CancellationToken::new(), &mut out)
            .await
            .unwrap();

        assert_eq!(outcome.status_code(), 1);
        assert_eq!(lines(&out).last().unwrap()["type"], "RUN_ERROR");
    }
}
