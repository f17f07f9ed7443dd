//! Workspace path resolution.
//!
//! A session workspace has a fixed shape:
//!
//! ```text
//! <root>/
//!   repos/<name>/        cloned repositories
//!   workflows/<name>/    active workflow checkout (or workflows/default)
//!   artifacts/           agent output
//!   file-uploads/        user uploads
//! ```
//!
//! [`resolve`] turns the configured repositories and workflow into the
//! agent's working directory plus the extra directories it may access.
//! Cloning is handled elsewhere; this module only computes paths and reads
//! the small config files found inside the workspace.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

const REPOS_DIR: &str = "repos";
const WORKFLOWS_DIR: &str = "workflows";
const DEFAULT_WORKFLOW: &str = "default";
const ARTIFACTS_DIR: &str = "artifacts";
const UPLOADS_DIR: &str = "file-uploads";

const MAX_LISTED_UPLOADS: usize = 10;
const MAX_LISTED_REPOS: usize = 5;

// ---------------------------------------------------------------------------
// Layout types
// ---------------------------------------------------------------------------

/// A repository checked out under `repos/<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
    pub branch: Option<String>,
    /// Opaque output target (fork/push destination) carried through as-is.
    pub output: Option<Value>,
}

/// The workflow repository driving the agent, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub git_url: String,
    pub branch: String,
    /// Subdirectory of the workflow repository to use.
    pub path: Option<String>,
}

impl WorkflowConfig {
    /// Directory name under `workflows/`, derived from the URL.
    pub fn name(&self) -> Option<String> {
        derive_repo_name(&self.git_url)
    }
}

/// Which repository becomes the working directory in multi-repo mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainRepoSelector {
    Name(String),
    /// Position in the repo list; out-of-range values select the first.
    Index(i64),
}

impl Default for MainRepoSelector {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl MainRepoSelector {
    /// Build from raw `MAIN_REPO_NAME` / `MAIN_REPO_INDEX` values. A name
    /// wins; an unparseable index selects the first repository.
    pub fn from_raw(name: Option<&str>, index: Option<&str>) -> Self {
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            return Self::Name(name.to_string());
        }
        let index = index
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .and_then(|i| i.parse::<i64>().ok())
            .unwrap_or(0);
        Self::Index(index)
    }
}

/// Everything that determines where the agent runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub repos: Vec<RepoConfig>,
    pub active_workflow: Option<WorkflowConfig>,
    pub main_repo: MainRepoSelector,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.root.join(REPOS_DIR).join(name)
    }

    /// Add a repository, replacing any existing entry with the same name.
    pub fn upsert_repo(&mut self, repo: RepoConfig) {
        match self.repos.iter_mut().find(|r| r.name == repo.name) {
            Some(existing) => *existing = repo,
            None => self.repos.push(repo),
        }
    }

    /// Remove a repository by name. Returns whether one was removed.
    pub fn remove_repo(&mut self, name: &str) -> bool {
        let before = self.repos.len();
        self.repos.retain(|r| r.name != name);
        self.repos.len() != before
    }
}

/// Resolved directories for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub working_dir: PathBuf,
    pub extra_dirs: Vec<PathBuf>,
    /// Set when a workflow is active and its name could be derived.
    pub workflow_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Compute the working directory and extra directories for `layout`.
pub fn resolve(layout: &WorkspaceLayout) -> WorkspacePaths {
    if let Some(workflow) = &layout.active_workflow {
        resolve_workflow(layout, workflow)
    } else if !layout.repos.is_empty() {
        resolve_multi_repo(layout)
    } else {
        WorkspacePaths {
            working_dir: layout.artifacts_dir(),
            extra_dirs: Vec::new(),
            workflow_name: None,
        }
    }
}

fn resolve_workflow(layout: &WorkspaceLayout, workflow: &WorkflowConfig) -> WorkspacePaths {
    let workflows = layout.root.join(WORKFLOWS_DIR);
    let workflow_name = workflow.name();
    let working_dir = match &workflow_name {
        Some(name) if workflows.join(name).exists() => {
            info!(workflow = %name, "using workflow as working directory");
            workflows.join(name)
        }
        Some(name) => {
            warn!(workflow = %name, "workflow directory not found, using default");
            workflows.join(DEFAULT_WORKFLOW)
        }
        None => {
            warn!(url = %workflow.git_url, "could not derive workflow name, using default");
            workflows.join(DEFAULT_WORKFLOW)
        }
    };

    let mut extra_dirs = Vec::new();
    for repo in &layout.repos {
        push_unique(&mut extra_dirs, layout.repo_dir(&repo.name));
    }
    push_unique(&mut extra_dirs, layout.artifacts_dir());
    push_unique(&mut extra_dirs, layout.uploads_dir());

    WorkspacePaths {
        working_dir,
        extra_dirs,
        workflow_name,
    }
}

fn resolve_multi_repo(layout: &WorkspaceLayout) -> WorkspacePaths {
    let main_name = match &layout.main_repo {
        MainRepoSelector::Name(name) => name.clone(),
        MainRepoSelector::Index(index) => {
            let index = usize::try_from(*index)
                .ok()
                .filter(|i| *i < layout.repos.len())
                .unwrap_or(0);
            layout.repos[index].name.clone()
        }
    };
    let working_dir = layout.repo_dir(&main_name);

    let mut extra_dirs = Vec::new();
    for repo in &layout.repos {
        let dir = layout.repo_dir(&repo.name);
        if dir != working_dir {
            extra_dirs.push(dir);
        }
    }
    push_unique(&mut extra_dirs, layout.artifacts_dir());
    push_unique(&mut extra_dirs, layout.uploads_dir());

    WorkspacePaths {
        working_dir,
        extra_dirs,
        workflow_name: None,
    }
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// Create the working directory if missing. When creation fails the
/// workspace root is used instead.
pub async fn ensure_working_dir(mut paths: WorkspacePaths, root: &Path) -> WorkspacePaths {
    if tokio::fs::try_exists(&paths.working_dir).await.unwrap_or(false) {
        return paths;
    }
    warn!(dir = %paths.working_dir.display(), "working directory does not exist, creating");
    if let Err(e) = tokio::fs::create_dir_all(&paths.working_dir).await {
        warn!(
            dir = %paths.working_dir.display(),
            error = %e,
            "failed to create working directory, falling back to workspace root"
        );
        paths.working_dir = root.to_path_buf();
    }
    paths
}

// ---------------------------------------------------------------------------
// Repository URLs
// ---------------------------------------------------------------------------

/// Split a repository reference into `(owner, name, host)`.
///
/// Accepts `https://host/owner/name(.git)`, `git@host:owner/name(.git)`,
/// `ssh://git@host/owner/name` and bare `owner/name`. Unrecognized input
/// yields empty owner and name. The host defaults to `github.com`.
pub fn parse_owner_repo(url: &str) -> (String, String, String) {
    let s = url.trim();
    let s = s.strip_suffix(".git").unwrap_or(s);
    let mut host = "github.com".to_string();

    if let Some((authority, path)) = split_url(s) {
        if !authority.is_empty() {
            host = authority;
        }
        let parts = segments(&path);
        if s.starts_with("http://") || s.starts_with("https://") {
            if parts.len() >= 2 {
                return (parts[0].to_string(), parts[1].to_string(), host);
            }
            return (String::new(), String::new(), host);
        }
        if parts.len() >= 2 {
            let n = parts.len();
            return (parts[n - 2].to_string(), parts[n - 1].to_string(), host);
        }
        return (String::new(), String::new(), host);
    }

    if let Some(rest) = s.strip_prefix("git@") {
        let (h, path) = rest.split_once(':').unwrap_or((rest, ""));
        if !h.is_empty() {
            host = h.to_string();
        }
        let parts = segments(path);
        if parts.len() >= 2 {
            let n = parts.len();
            return (parts[n - 2].to_string(), parts[n - 1].to_string(), host);
        }
        return (String::new(), String::new(), host);
    }

    let parts = segments(s);
    if parts.len() == 2 {
        return (parts[0].to_string(), parts[1].to_string(), host);
    }
    (String::new(), String::new(), host)
}

/// Repository name for a URL: the parsed repo name, else the last path
/// segment, minus any `.git` suffix.
pub fn derive_repo_name(url: &str) -> Option<String> {
    let (_, name, _) = parse_owner_repo(url);
    let name = if name.is_empty() {
        let path = split_url(url.trim())
            .map(|(_, path)| path)
            .unwrap_or_else(|| url.trim().to_string());
        segments(&path).last().map(|s| s.to_string()).unwrap_or_default()
    } else {
        name
    };
    let name = name.strip_suffix(".git").unwrap_or(&name).trim().to_string();
    is_valid_repo_name(&name).then_some(name)
}

/// Whether `name` can be used as a single directory under `repos/` or
/// `workflows/`: non-empty, not `.` or `..`, and free of path separators.
pub fn is_valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// `scheme://[user@]host[:port]/path` into `(host, path)`.
fn split_url(s: &str) -> Option<(String, String)> {
    let (_, rest) = s.split_once("://")?;
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    Some((host.to_string(), path.to_string()))
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Parse the `REPOS_JSON` list: `[{"name", "input": {"url", "branch"},
/// "output"}]`. Names missing from an entry are derived from its URL and
/// entries without a URL are dropped. Malformed JSON yields no repos.
pub fn parse_repos_json(raw: &str) -> Vec<RepoConfig> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let items = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            warn!("REPOS_JSON is not a list, ignoring");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "failed to parse REPOS_JSON");
            return Vec::new();
        }
    };

    items
        .iter()
        .filter_map(|item| {
            let item = item.as_object()?;
            let input = item.get("input").and_then(Value::as_object)?;
            let url = input
                .get("url")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|u| !u.is_empty())?;
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .or_else(|| derive_repo_name(url))?;
            if !is_valid_repo_name(&name) {
                warn!(name = %name, "invalid repository name in REPOS_JSON, skipping");
                return None;
            }
            let branch = input
                .get("branch")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string);
            Some(RepoConfig {
                name,
                url: url.to_string(),
                branch,
                output: item.get("output").filter(|o| !o.is_null()).cloned(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Workspace config files
// ---------------------------------------------------------------------------

/// `.ambient/ambient.json` inside a workflow directory.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbientConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Load the workflow's ambient config; missing or malformed files yield the
/// default.
pub async fn load_ambient_config(working_dir: &Path) -> AmbientConfig {
    let path = working_dir.join(".ambient").join("ambient.json");
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(_) => {
            info!(path = %path.display(), "no ambient.json found, using defaults");
            return AmbientConfig::default();
        }
    };
    match serde_json::from_str::<AmbientConfig>(&raw) {
        Ok(config) => {
            info!(name = ?config.name, "loaded ambient.json");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse ambient.json");
            AmbientConfig::default()
        }
    }
}

/// Read the `mcpServers` table of an MCP config file.
pub async fn load_mcp_servers(path: &Path) -> Option<Map<String, Value>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => {
            info!(path = %path.display(), "no MCP config found");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(mut config)) => match config.remove("mcpServers") {
            Some(Value::Object(servers)) => Some(servers),
            _ => Some(Map::new()),
        },
        Ok(_) => {
            warn!(path = %path.display(), "MCP config is not an object");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse MCP config");
            None
        }
    }
}

/// System prompt describing the workspace to the agent.
pub fn workspace_context_prompt(
    layout: &WorkspaceLayout,
    workflow_name: Option<&str>,
    ambient: &AmbientConfig,
) -> String {
    let mut prompt = String::from("# Workspace Structure\n\n");

    if let Some(name) = workflow_name {
        prompt.push_str(&format!(
            "**Working Directory**: workflows/{name}/ (workflow logic - do not create files here)\n\n"
        ));
    }

    prompt.push_str(&format!(
        "**Artifacts**: {ARTIFACTS_DIR} (create all output files here)\n\n"
    ));

    let uploads = layout.uploads_dir();
    if uploads.is_dir() {
        let mut files: Vec<String> = std::fs::read_dir(&uploads)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        if !files.is_empty() {
            if files.len() <= MAX_LISTED_UPLOADS {
                prompt.push_str(&format!("**Uploaded Files**: {}\n\n", files.join(", ")));
            } else {
                prompt.push_str(&format!(
                    "**Uploaded Files** ({} total): {}, and {} more\n\n",
                    files.len(),
                    files[..MAX_LISTED_UPLOADS].join(", "),
                    files.len() - MAX_LISTED_UPLOADS
                ));
            }
        }
    } else {
        prompt.push_str("**Uploaded Files**: None\n\n");
    }

    if !layout.repos.is_empty() {
        let listed: Vec<String> = layout
            .repos
            .iter()
            .take(MAX_LISTED_REPOS)
            .map(|r| format!("repos/{}/", r.name))
            .collect();
        if layout.repos.len() <= MAX_LISTED_REPOS {
            prompt.push_str(&format!("**Repositories**: {}\n\n", listed.join(", ")));
        } else {
            prompt.push_str(&format!(
                "**Repositories** ({} total): {}, and {} more\n\n",
                layout.repos.len(),
                listed.join(", "),
                layout.repos.len() - MAX_LISTED_REPOS
            ));
        }
    }

    prompt.push_str("## MCP Integrations\n");
    prompt.push_str(
        "If you need Google Drive access: Ask user to go to Integrations page in Ambient and authenticate with Google Drive.\n",
    );
    prompt.push_str(
        "If you need Jira access: Ask user to go to Workspace Settings in Ambient and configure Jira credentials there.\n\n",
    );

    if let Some(instructions) = ambient.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("## Workflow Instructions\n{instructions}\n\n"));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(name: &str) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            url: format!("https://github.com/acme/{name}.git"),
            branch: None,
            output: None,
        }
    }

    fn workflow(url: &str) -> WorkflowConfig {
        WorkflowConfig {
            git_url: url.to_string(),
            branch: "main".to_string(),
            path: None,
        }
    }

    #[test]
    fn parse_owner_repo_forms() {
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widgets.git"),
            ("acme".into(), "widgets".into(), "github.com".into())
        );
        assert_eq!(
            parse_owner_repo("git@gitlab.example.com:team/tool.git"),
            ("team".into(), "tool".into(), "gitlab.example.com".into())
        );
        assert_eq!(
            parse_owner_repo("ssh://git@host.io/group/sub/proj"),
            ("sub".into(), "proj".into(), "host.io".into())
        );
        assert_eq!(
            parse_owner_repo("acme/widgets"),
            ("acme".into(), "widgets".into(), "github.com".into())
        );
        assert_eq!(
            parse_owner_repo("not a url"),
            ("".into(), "".into(), "github.com".into())
        );
    }

    #[test]
    fn derive_repo_name_falls_back_to_last_segment() {
        assert_eq!(
            derive_repo_name("https://github.com/acme/widgets.git").as_deref(),
            Some("widgets")
        );
        assert_eq!(
            derive_repo_name("https://example.com/single.git").as_deref(),
            Some("single")
        );
        assert_eq!(derive_repo_name("   "), None);
    }

    #[test]
    fn repo_names_must_stay_inside_their_directory() {
        assert!(is_valid_repo_name("widgets"));
        assert!(is_valid_repo_name("my.repo-2"));
        assert!(!is_valid_repo_name(""));
        assert!(!is_valid_repo_name("."));
        assert!(!is_valid_repo_name(".."));
        assert!(!is_valid_repo_name("../../tmp/x"));
        assert!(!is_valid_repo_name("a/b"));
        assert!(!is_valid_repo_name("a\\b"));
        assert_eq!(derive_repo_name("https://example.com/.."), None);
    }

    #[test]
    fn repos_json_skips_names_that_escape_the_workspace() {
        let raw = r#"[
            {"name": "../../tmp/x", "input": {"url": "https://github.com/acme/api.git"}},
            {"name": "ok", "input": {"url": "https://github.com/acme/web.git"}}
        ]"#;
        let repos = parse_repos_json(raw);
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "ok");
    }

    #[test]
    fn repos_json_derives_names_and_drops_entries_without_url() {
        let raw = r#"[
            {"input": {"url": "https://github.com/acme/api.git", "branch": "dev"}},
            {"name": "web", "input": {"url": "https://github.com/acme/web"}, "output": {"url": "x"}},
            {"name": "nourl", "input": {}},
            "garbage"
        ]"#;
        let repos = parse_repos_json(raw);
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].name, "api");
        assert_eq!(repos[0].branch.as_deref(), Some("dev"));
        assert_eq!(repos[1].name, "web");
        assert!(repos[1].output.is_some());
    }

    #[test]
    fn repos_json_malformed_is_empty() {
        assert!(parse_repos_json("{not json").is_empty());
        assert!(parse_repos_json("{}").is_empty());
        assert!(parse_repos_json("").is_empty());
    }

    #[test]
    fn main_repo_selector_from_raw() {
        assert_eq!(
            MainRepoSelector::from_raw(Some(" api "), Some("3")),
            MainRepoSelector::Name("api".into())
        );
        assert_eq!(
            MainRepoSelector::from_raw(None, Some("2")),
            MainRepoSelector::Index(2)
        );
        assert_eq!(
            MainRepoSelector::from_raw(Some(""), Some("two")),
            MainRepoSelector::Index(0)
        );
    }

    #[test]
    fn resolve_without_repos_or_workflow_uses_artifacts() {
        let layout = WorkspaceLayout::new("/ws");
        let paths = resolve(&layout);
        assert_eq!(paths.working_dir, PathBuf::from("/ws/artifacts"));
        assert!(paths.extra_dirs.is_empty());
        assert!(paths.workflow_name.is_none());
    }

    #[test]
    fn resolve_multi_repo_selects_main_by_index() {
        let mut layout = WorkspaceLayout::new("/ws");
        layout.repos = vec![repo("a"), repo("b"), repo("c")];
        layout.main_repo = MainRepoSelector::Index(1);
        let paths = resolve(&layout);
        assert_eq!(paths.working_dir, PathBuf::from("/ws/repos/b"));
        assert_eq!(
            paths.extra_dirs,
            vec![
                PathBuf::from("/ws/repos/a"),
                PathBuf::from("/ws/repos/c"),
                PathBuf::from("/ws/artifacts"),
                PathBuf::from("/ws/file-uploads"),
            ]
        );
    }

    #[test]
    fn resolve_multi_repo_out_of_range_index_uses_first() {
        let mut layout = WorkspaceLayout::new("/ws");
        layout.repos = vec![repo("a"), repo("b")];
        layout.main_repo = MainRepoSelector::Index(7);
        assert_eq!(resolve(&layout).working_dir, PathBuf::from("/ws/repos/a"));
        layout.main_repo = MainRepoSelector::Index(-1);
        assert_eq!(resolve(&layout).working_dir, PathBuf::from("/ws/repos/a"));
    }

    #[test]
    fn resolve_multi_repo_by_name() {
        let mut layout = WorkspaceLayout::new("/ws");
        layout.repos = vec![repo("a"), repo("b")];
        layout.main_repo = MainRepoSelector::Name("b".into());
        let paths = resolve(&layout);
        assert_eq!(paths.working_dir, PathBuf::from("/ws/repos/b"));
        assert_eq!(paths.extra_dirs[0], PathBuf::from("/ws/repos/a"));
    }

    #[test]
    fn resolve_workflow_uses_existing_checkout() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workflows/spec-kit")).unwrap();
        let mut layout = WorkspaceLayout::new(dir.path());
        layout.repos = vec![repo("a")];
        layout.active_workflow = Some(workflow("https://github.com/acme/spec-kit.git"));

        let paths = resolve(&layout);
        assert_eq!(paths.working_dir, dir.path().join("workflows/spec-kit"));
        assert_eq!(paths.workflow_name.as_deref(), Some("spec-kit"));
        assert_eq!(
            paths.extra_dirs,
            vec![
                dir.path().join("repos/a"),
                dir.path().join("artifacts"),
                dir.path().join("file-uploads"),
            ]
        );
    }

    #[test]
    fn resolve_workflow_missing_checkout_uses_default() {
        let dir = TempDir::new().unwrap();
        let mut layout = WorkspaceLayout::new(dir.path());
        layout.active_workflow = Some(workflow("https://github.com/acme/absent"));
        let paths = resolve(&layout);
        assert_eq!(paths.working_dir, dir.path().join("workflows/default"));
        assert_eq!(paths.workflow_name.as_deref(), Some("absent"));
    }

    #[tokio::test]
    async fn ensure_working_dir_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let paths = WorkspacePaths {
            working_dir: dir.path().join("artifacts"),
            extra_dirs: vec![],
            workflow_name: None,
        };
        let ensured = ensure_working_dir(paths, dir.path()).await;
        assert_eq!(ensured.working_dir, dir.path().join("artifacts"));
        assert!(ensured.working_dir.is_dir());
    }

    #[tokio::test]
    async fn ensure_working_dir_falls_back_to_root() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        let paths = WorkspacePaths {
            working_dir: blocker.join("sub"),
            extra_dirs: vec![],
            workflow_name: None,
        };
        let ensured = ensure_working_dir(paths, dir.path()).await;
        assert_eq!(ensured.working_dir, dir.path());
    }

    #[tokio::test]
    async fn ambient_config_loads_system_prompt() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".ambient")).unwrap();
        std::fs::write(
            dir.path().join(".ambient/ambient.json"),
            r#"{"name": "Spec Kit", "systemPrompt": "Follow the phases."}"#,
        )
        .unwrap();
        let config = load_ambient_config(dir.path()).await;
        assert_eq!(config.name.as_deref(), Some("Spec Kit"));
        assert_eq!(config.system_prompt.as_deref(), Some("Follow the phases."));

        let missing = load_ambient_config(&dir.path().join("nope")).await;
        assert_eq!(missing, AmbientConfig::default());
    }

    #[tokio::test]
    async fn mcp_servers_are_read_from_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".mcp.json");
        std::fs::write(&path, r#"{"mcpServers": {"webfetch": {"command": "x"}}}"#).unwrap();
        let servers = load_mcp_servers(&path).await.unwrap();
        assert!(servers.contains_key("webfetch"));

        std::fs::write(&path, "not json").unwrap();
        assert!(load_mcp_servers(&path).await.is_none());
        assert!(load_mcp_servers(&dir.path().join("absent.json")).await.is_none());
    }

    #[test]
    fn context_prompt_lists_workspace() {
        let dir = TempDir::new().unwrap();
        let mut layout = WorkspaceLayout::new(dir.path());
        layout.repos = (0..7).map(|i| repo(&format!("r{i}"))).collect();
        let ambient = AmbientConfig {
            name: None,
            system_prompt: Some("Be brief.".into()),
        };

        let prompt = workspace_context_prompt(&layout, Some("spec-kit"), &ambient);
        assert!(prompt.starts_with("# Workspace Structure\n\n"));
        assert!(prompt.contains("**Working Directory**: workflows/spec-kit/"));
        assert!(prompt.contains("**Artifacts**: artifacts (create all output files here)"));
        assert!(prompt.contains("**Uploaded Files**: None"));
        assert!(prompt.contains("**Repositories** (7 total): repos/r0/, repos/r1/, repos/r2/, repos/r3/, repos/r4/, and 2 more"));
        assert!(prompt.contains("## Workflow Instructions\nBe brief.\n\n"));
    }

    #[test]
    fn context_prompt_lists_uploads() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("file-uploads")).unwrap();
        std::fs::write(dir.path().join("file-uploads/b.txt"), "").unwrap();
        std::fs::write(dir.path().join("file-uploads/a.pdf"), "").unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        let prompt = workspace_context_prompt(&layout, None, &AmbientConfig::default());
        assert!(prompt.contains("**Uploaded Files**: a.pdf, b.txt"));
        assert!(!prompt.contains("Working Directory"));
        assert!(!prompt.contains("Workflow Instructions"));
    }

    #[test]
    fn layout_repo_editing() {
        let mut layout = WorkspaceLayout::new("/ws");
        layout.upsert_repo(repo("a"));
        layout.upsert_repo(RepoConfig {
            branch: Some("dev".into()),
            ..repo("a")
        });
        assert_eq!(layout.repos.len(), 1);
        assert_eq!(layout.repos[0].branch.as_deref(), Some("dev"));
        assert!(layout.remove_repo("a"));
        assert!(!layout.remove_repo("a"));
    }
}
