mod config;
mod run_cmd;
mod serve_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use relay_core::credentials::{BackendCredentialProvider, CredentialProvider, NoCredentials};
use relay_core::tracker::{TracingSink, UserContext};
use relay_core::{ClaudeCodeBridge, Collaborators, RunController, RunOutcome, RunnerSettings};

use config::{CliOverrides, RunnerConfig};

#[derive(Parser)]
#[command(name = "relay", about = "Stream Claude Code runs as AG-UI protocol events")]
struct Cli {
    /// Workspace root (overrides WORKSPACE_PATH env var)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Model to run (overrides LLM_MODEL env var)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Path to the claude binary (overrides CLAUDE_BINARY env var)
    #[arg(long, global = true)]
    claude_binary: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the AG-UI endpoint over HTTP
    Serve {
        /// Bind address (overrides AGUI_HOST env var)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides AGUI_PORT env var)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single turn and print its events as JSON lines
    Run {
        /// User message to send
        #[arg(long)]
        prompt: String,
    },
}

/// Wire the controller and its collaborators from resolved config.
fn build_controller(config: &RunnerConfig) -> anyhow::Result<Arc<RunController>> {
    let credentials: Arc<dyn CredentialProvider> = match (&config.backend_url, &config.project) {
        (Some(base), Some(project)) => Arc::new(
            BackendCredentialProvider::new(base, project, &config.session_id, config.bot_token.clone())
                .context("failed to build credential client")?,
        ),
        _ => {
            info!("BACKEND_API_URL or project not set, running without backend credentials");
            Arc::new(NoCredentials)
        }
    };
    let observability = Arc::new(TracingSink::new(
        config.session_id.clone(),
        UserContext::sanitized(&config.user_id, &config.user_name),
    ));

    let mcp_config = if config.mcp_config.exists() {
        Some(config.mcp_config.clone())
    } else {
        warn!(path = %config.mcp_config.display(), "MCP config not found, continuing without MCP servers");
        None
    };

    let settings = RunnerSettings {
        session_id: config.session_id.clone(),
        namespace: config.namespace.clone(),
        model: config.model.clone(),
        is_resume: config.is_resume,
        mcp_config,
        auth_env: config.auth_env.clone(),
    };

    Ok(Arc::new(RunController::new(
        settings,
        config.workspace.clone(),
        Arc::new(ClaudeCodeBridge::with_binary(config.claude_binary.clone())),
        Collaborators {
            credentials,
            observability,
        },
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut overrides = CliOverrides {
        workspace: cli.workspace,
        model: cli.model,
        claude_binary: cli.claude_binary,
        ..CliOverrides::default()
    };
    if let Commands::Serve { host, port } = &cli.command {
        overrides.host = host.clone();
        overrides.port = *port;
    }

    let config = RunnerConfig::from_env(&overrides)?;
    info!(
        session_id = %config.session_id,
        workspace = %config.workspace.root.display(),
        repos = config.workspace.repos.len(),
        resume = config.is_resume,
        "relay configured"
    );
    let controller = build_controller(&config)?;

    match cli.command {
        Commands::Serve { .. } => {
            serve_cmd::run_serve(controller, &config.bind_addr()).await?;
        }
        Commands::Run { prompt } => {
            let outcome = run_cmd::run_once(controller, &prompt).await?;
            if outcome != RunOutcome::Succeeded {
                eprintln!("{outcome}");
                std::process::exit(outcome.status_code());
            }
        }
    }

    Ok(())
}
