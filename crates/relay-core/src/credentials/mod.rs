//! Runtime credentials for the agent's tools.
//!
//! Before each run the controller asks a [`CredentialProvider`] for fresh
//! integration credentials and turns them into child-process environment
//! variables with [`credential_env`]. Fetching is best-effort: a provider
//! that cannot reach its backend returns empty credentials and the run
//! proceeds.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const PLACEHOLDER_EMAIL: &str = "user@example.com";
const DEFAULT_GIT_NAME: &str = "Ambient Code Bot";
const DEFAULT_GIT_EMAIL: &str = "bot@ambient-code.local";

/// Integrations the backend can hold credentials for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Github,
    Gitlab,
    Google,
    Jira,
}

impl CredentialKind {
    /// Fetch order; later identities override earlier ones.
    pub const ALL: [CredentialKind; 4] = [Self::Google, Self::Jira, Self::Gitlab, Self::Github];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Google => "google",
            Self::Jira => "jira",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential payload as returned by the backend (camelCase keys such as
/// `token`, `userName`, `email`, `apiToken`, `url`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials(Map<String, Value>);

impl Credentials {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Non-empty string value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch credentials of one kind. Never fails; unavailable credentials
    /// are returned empty.
    async fn fetch(&self, kind: CredentialKind) -> Credentials;
}

const _: () = {
    fn _assert_object_safe(_: &dyn CredentialProvider) {}
};

/// Fetch every kind in [`CredentialKind::ALL`] order.
pub async fn fetch_all(provider: &dyn CredentialProvider) -> Vec<(CredentialKind, Credentials)> {
    let mut out = Vec::with_capacity(CredentialKind::ALL.len());
    for kind in CredentialKind::ALL {
        out.push((kind, provider.fetch(kind).await));
    }
    out
}

/// Provider for local runs with no credential backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn fetch(&self, _kind: CredentialKind) -> Credentials {
        Credentials::empty()
    }
}

// ---------------------------------------------------------------------------
// Backend provider
// ---------------------------------------------------------------------------

/// Fetches credentials from the session backend:
/// `GET {base}/projects/{project}/agentic-sessions/{session}/credentials/{kind}`.
pub struct BackendCredentialProvider {
    client: reqwest::Client,
    base_url: String,
    project: String,
    session_id: String,
    bot_token: Option<String>,
}

impl BackendCredentialProvider {
    pub fn new(
        base_url: &str,
        project: &str,
        session_id: &str,
        bot_token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            project: project.trim().to_string(),
            session_id: session_id.trim().to_string(),
            bot_token: bot_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, kind: CredentialKind) -> String {
        format!(
            "{}/projects/{}/agentic-sessions/{}/credentials/{}",
            self.base_url, self.project, self.session_id, kind
        )
    }

    async fn try_fetch(&self, kind: CredentialKind) -> Result<Credentials, reqwest::Error> {
        let mut request = self.client.get(self.url(kind));
        if let Some(token) = &self.bot_token {
            request = request.bearer_auth(token);
        }
        let body: Value = request.send().await?.error_for_status()?.json().await?;
        Ok(match body {
            Value::Object(map) => Credentials::from_map(map),
            _ => Credentials::empty(),
        })
    }
}

#[async_trait]
impl CredentialProvider for BackendCredentialProvider {
    async fn fetch(&self, kind: CredentialKind) -> Credentials {
        if self.base_url.is_empty() || self.project.is_empty() || self.session_id.is_empty() {
            warn!(
                kind = %kind,
                base = %self.base_url,
                project = %self.project,
                session = %self.session_id,
                "cannot fetch credentials: backend not configured"
            );
            return Credentials::empty();
        }
        match self.try_fetch(kind).await {
            Ok(creds) => {
                info!(kind = %kind, found = !creds.is_empty(), "fetched credentials from backend");
                creds
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "credential fetch failed");
                Credentials::empty()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Environment mapping
// ---------------------------------------------------------------------------

/// Map fetched credentials to child-process environment variables.
///
/// Git identity comes from GitHub when present, else GitLab, else the bot
/// defaults; it is always set.
pub fn credential_env(fetched: &[(CredentialKind, Credentials)]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let mut git_name: Option<String> = None;
    let mut git_email: Option<String> = None;

    let find = |kind: CredentialKind| {
        fetched
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| c)
    };

    if let Some(google) = find(CredentialKind::Google) {
        if google.get("accessToken").is_some() {
            if let Some(email) = google.get("email").filter(|e| *e != PLACEHOLDER_EMAIL) {
                env.insert("USER_GOOGLE_EMAIL".to_string(), email.to_string());
            }
        }
    }

    if let Some(jira) = find(CredentialKind::Jira) {
        if let Some(token) = jira.get("apiToken") {
            env.insert("JIRA_URL".to_string(), jira.get("url").unwrap_or_default().to_string());
            env.insert("JIRA_API_TOKEN".to_string(), token.to_string());
            env.insert(
                "JIRA_EMAIL".to_string(),
                jira.get("email").unwrap_or_default().to_string(),
            );
        }
    }

    for kind in [CredentialKind::Gitlab, CredentialKind::Github] {
        let Some(creds) = find(kind) else { continue };
        let Some(token) = creds.get("token") else { continue };
        let var = match kind {
            CredentialKind::Github => "GITHUB_TOKEN",
            _ => "GITLAB_TOKEN",
        };
        env.insert(var.to_string(), token.to_string());
        if let Some(name) = creds.get("userName") {
            git_name = Some(name.trim().to_string());
        }
        if let Some(email) = creds.get("email") {
            git_email = Some(email.trim().to_string());
        }
    }

    env.insert(
        "GIT_USER_NAME".to_string(),
        git_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_GIT_NAME.to_string()),
    );
    env.insert(
        "GIT_USER_EMAIL".to_string(),
        git_email
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_GIT_EMAIL.to_string()),
    );
    env
}
