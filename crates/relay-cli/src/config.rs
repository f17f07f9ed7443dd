//! Configuration for the relay runner.
//!
//! Provides an optional TOML config file at `~/.config/relay/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.
//! Environment reads go through a lookup function so resolution can be
//! tested without touching the process environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use relay_core::workspace::{MainRepoSelector, RepoConfig, WorkflowConfig, WorkspaceLayout, parse_repos_json};

// -----------------------------------------------------------------------
// Defaults
// -----------------------------------------------------------------------

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_WORKSPACE: &str = "/workspace";
pub const DEFAULT_MCP_CONFIG: &str = "/app/claude-runner/.mcp.json";
pub const DEFAULT_CLAUDE_BINARY: &str = "claude";
const DEFAULT_SESSION_ID: &str = "unknown";

/// Environment variables forwarded to authentication resolution.
const AUTH_VARS: [&str; 5] = [
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_USE_VERTEX",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "ANTHROPIC_VERTEX_PROJECT_ID",
    "CLOUD_ML_REGION",
];

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub runner: RunnerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunnerSection {
    pub workspace_path: Option<PathBuf>,
    pub model: Option<String>,
    pub claude_binary: Option<String>,
    pub mcp_config: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the relay config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/relay` or `~/.config/relay`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("relay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("relay")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the default config file if it exists. A file that exists but does
/// not parse is an error.
pub fn load_default_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    load_config(&path).map(Some)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values supplied on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workspace: Option<PathBuf>,
    pub model: Option<String>,
    pub claude_binary: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub host: String,
    pub port: u16,
    pub session_id: String,
    pub namespace: String,
    pub model: Option<String>,
    pub is_resume: bool,
    pub claude_binary: String,
    pub mcp_config: PathBuf,
    pub workspace: WorkspaceLayout,
    pub backend_url: Option<String>,
    pub project: Option<String>,
    pub bot_token: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub auth_env: HashMap<String, String>,
}

impl RunnerConfig {
    /// Resolve from the process environment and the default config file.
    pub fn from_env(cli: &CliOverrides) -> Result<Self> {
        let file = load_default_config()?;
        Self::resolve(cli, |key| std::env::var(key).ok(), file.as_ref())
    }

    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Bind address: `--host`/`--port` > `AGUI_HOST`/`AGUI_PORT` > `[server]` > `0.0.0.0:8000`
    /// - Workspace root: `--workspace` > `WORKSPACE_PATH` > `[runner].workspace_path` > `/workspace`
    /// - Model: `--model` > `LLM_MODEL` > `[runner].model` > agent default
    /// - Session identity and backend settings come from the environment only.
    pub fn resolve(
        cli: &CliOverrides,
        lookup: impl Fn(&str) -> Option<String>,
        file: Option<&ConfigFile>,
    ) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let server = file.map(|f| &f.server);
        let runner = file.map(|f| &f.runner);

        let host = cli
            .host
            .clone()
            .or_else(|| get("AGUI_HOST"))
            .or_else(|| server.and_then(|s| s.host.clone()))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match cli.port {
            Some(port) => port,
            None => match get("AGUI_PORT") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("AGUI_PORT is not a valid port: {raw}"))?,
                None => server.and_then(|s| s.port).unwrap_or(DEFAULT_PORT),
            },
        };

        let root = cli
            .workspace
            .clone()
            .or_else(|| get("WORKSPACE_PATH").map(PathBuf::from))
            .or_else(|| runner.and_then(|r| r.workspace_path.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));

        let model = cli
            .model
            .clone()
            .or_else(|| get("LLM_MODEL"))
            .or_else(|| runner.and_then(|r| r.model.clone()));

        let claude_binary = cli
            .claude_binary
            .clone()
            .or_else(|| get("CLAUDE_BINARY"))
            .or_else(|| runner.and_then(|r| r.claude_binary.clone()))
            .unwrap_or_else(|| DEFAULT_CLAUDE_BINARY.to_string());

        let mcp_config = get("MCP_CONFIG_FILE")
            .map(PathBuf::from)
            .or_else(|| runner.and_then(|r| r.mcp_config.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MCP_CONFIG));

        let namespace = get("AGENTIC_SESSION_NAMESPACE").unwrap_or_default();
        let workspace = WorkspaceLayout {
            root,
            repos: get("REPOS_JSON")
                .map(|raw| parse_repos_json(&raw))
                .unwrap_or_default(),
            active_workflow: workflow_from(&get),
            main_repo: MainRepoSelector::from_raw(
                get("MAIN_REPO_NAME").as_deref(),
                get("MAIN_REPO_INDEX").as_deref(),
            ),
        };

        let auth_env = AUTH_VARS
            .iter()
            .filter_map(|key| get(key).map(|v| (key.to_string(), v)))
            .collect();

        Ok(Self {
            host,
            port,
            session_id: get("SESSION_ID").unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
            project: get("PROJECT_NAME").or_else(|| Some(namespace.clone()).filter(|n| !n.is_empty())),
            namespace,
            model,
            is_resume: get("IS_RESUME").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            claude_binary,
            mcp_config,
            workspace,
            backend_url: get("BACKEND_API_URL"),
            bot_token: get("BOT_TOKEN"),
            user_id: get("USER_ID").unwrap_or_default(),
            user_name: get("USER_NAME").unwrap_or_default(),
            auth_env,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn workflow_from(get: &impl Fn(&str) -> Option<String>) -> Option<WorkflowConfig> {
    let git_url = get("ACTIVE_WORKFLOW_GIT_URL")?;
    Some(WorkflowConfig {
        git_url,
        branch: get("ACTIVE_WORKFLOW_BRANCH").unwrap_or_else(|| "main".to_string()),
        path: get("ACTIVE_WORKFLOW_PATH"),
    })
}

/// Build a repository entry for a URL, deriving the name when none is given.
pub fn repo_entry(url: &str, branch: Option<&str>, name: Option<&str>) -> Option<RepoConfig> {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| relay_core::workspace::derive_repo_name(url))?;
    Some(RepoConfig {
        name,
        url: url.to_string(),
        branch: branch.map(str::to_string),
        output: None,
    })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
