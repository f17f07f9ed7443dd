//! Phase prerequisites for slash-command prompts.
//!
//! Phase commands depend on the artifact produced by the previous phase.
//! A required file counts as present at the workspace root or inside any
//! `specs/<feature>/` directory below it. The directory scan runs on the
//! blocking pool since the workspace may hold whole cloned repositories.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// A phase command was issued before its input artifact exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PrerequisiteError {
    pub command: &'static str,
    pub required_file: &'static str,
    pub message: &'static str,
}

struct Phase {
    command: &'static str,
    required_file: &'static str,
    message: &'static str,
}

const PHASES: &[Phase] = &[
    Phase {
        command: "/speckit.plan",
        required_file: "spec.md",
        message: "Specification file (spec.md) not found. Please run /speckit.specify first.",
    },
    Phase {
        command: "/speckit.tasks",
        required_file: "plan.md",
        message: "Planning file (plan.md) not found. Please run /speckit.plan first.",
    },
    Phase {
        command: "/speckit.implement",
        required_file: "tasks.md",
        message: "Tasks file (tasks.md) not found. Please run /speckit.tasks first.",
    },
];

/// Check the prompt's phase command, if any, against the workspace.
pub async fn validate_prerequisites(
    prompt: &str,
    workspace_root: &Path,
) -> Result<(), PrerequisiteError> {
    let prompt = prompt.trim().to_lowercase();
    let Some(phase) = PHASES.iter().find(|p| prompt.starts_with(p.command)) else {
        return Ok(());
    };

    let root = workspace_root.to_path_buf();
    let file = phase.required_file;
    let present = tokio::task::spawn_blocking(move || {
        root.join(file).exists() || found_in_specs(&root, file)
    })
    .await
    .unwrap_or_else(|e| {
        // A failed scan must not block the run.
        warn!(command = phase.command, error = %e, "prerequisite scan failed");
        true
    });

    if present {
        debug!(command = phase.command, file = phase.required_file, "prerequisite present");
        return Ok(());
    }

    Err(PrerequisiteError {
        command: phase.command,
        required_file: phase.required_file,
        message: phase.message,
    })
}

/// Whether `file` exists in some `specs/<dir>/` at any depth under `dir`.
fn found_in_specs(dir: &Path, file: &str) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.filter_map(Result::ok) {
        // Symlinks are not followed.
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let path = entry.path();
        if entry.file_name() == "specs" && feature_dir_has(&path, file) {
            return true;
        }
        if found_in_specs(&path, file) {
            return true;
        }
    }
    false
}

fn feature_dir_has(specs: &Path, file: &str) -> bool {
    fs::read_dir(specs)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|e| e.path().is_dir() && e.path().join(file).exists())
        })
        .unwrap_or(false)
}
