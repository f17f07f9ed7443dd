//! Authentication mode selection for the agent process.
//!
//! The agent talks either to the Anthropic API directly (API key) or to
//! Claude on Vertex AI through a Google service account.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

/// Model reported to observability when none is configured.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5@20250929";

/// How the agent process authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey(String),
    Vertex {
        credentials_path: String,
        project_id: String,
        region: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Either ANTHROPIC_API_KEY or CLAUDE_CODE_USE_VERTEX=1 must be set")]
    NotConfigured,
    #[error("GOOGLE_APPLICATION_CREDENTIALS must be set when CLAUDE_CODE_USE_VERTEX=1")]
    MissingCredentialsPath,
    #[error("ANTHROPIC_VERTEX_PROJECT_ID must be set when CLAUDE_CODE_USE_VERTEX=1")]
    MissingProject,
    #[error("CLOUD_ML_REGION must be set when CLAUDE_CODE_USE_VERTEX=1")]
    MissingRegion,
    #[error("Service account key file not found at {0}")]
    CredentialsFileNotFound(String),
}

/// Pick the auth mode from the environment seen through `lookup`.
///
/// Vertex mode wins when `CLAUDE_CODE_USE_VERTEX=1`, even if an API key is
/// also present.
pub fn resolve_auth(lookup: impl Fn(&str) -> Option<String>) -> Result<AuthMode, AuthError> {
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if get("CLAUDE_CODE_USE_VERTEX").as_deref() == Some("1") {
        let credentials_path =
            get("GOOGLE_APPLICATION_CREDENTIALS").ok_or(AuthError::MissingCredentialsPath)?;
        let project_id = get("ANTHROPIC_VERTEX_PROJECT_ID").ok_or(AuthError::MissingProject)?;
        let region = get("CLOUD_ML_REGION").ok_or(AuthError::MissingRegion)?;
        if !Path::new(&credentials_path).exists() {
            return Err(AuthError::CredentialsFileNotFound(credentials_path));
        }
        info!(project = %project_id, region = %region, "Vertex AI auth configured");
        return Ok(AuthMode::Vertex {
            credentials_path,
            project_id,
            region,
        });
    }

    match get("ANTHROPIC_API_KEY") {
        Some(key) => Ok(AuthMode::ApiKey(key)),
        None => Err(AuthError::NotConfigured),
    }
}

impl AuthMode {
    pub fn is_vertex(&self) -> bool {
        matches!(self, Self::Vertex { .. })
    }

    /// Write this mode's variables into a child-process environment.
    ///
    /// Returns the keys that must be removed from the inherited
    /// environment.
    pub fn apply(&self, env: &mut HashMap<String, String>) -> Vec<&'static str> {
        match self {
            Self::ApiKey(key) => {
                env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
                Vec::new()
            }
            Self::Vertex {
                credentials_path,
                project_id,
                region,
            } => {
                env.insert("CLAUDE_CODE_USE_VERTEX".to_string(), "1".to_string());
                env.insert(
                    "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                    credentials_path.clone(),
                );
                env.insert("ANTHROPIC_VERTEX_PROJECT_ID".to_string(), project_id.clone());
                env.insert("CLOUD_ML_REGION".to_string(), region.clone());
                env.remove("ANTHROPIC_API_KEY");
                vec!["ANTHROPIC_API_KEY"]
            }
        }
    }

    /// The model id to pass to the agent for a configured model name.
    pub fn model_id(&self, model: &str) -> String {
        if self.is_vertex() {
            map_to_vertex_model(model)
        } else {
            model.to_string()
        }
    }
}

/// Map Anthropic API model names to Vertex AI model ids.
///
/// Unknown names pass through unchanged. Matching is case-sensitive.
pub fn map_to_vertex_model(model: &str) -> String {
    match model {
        "claude-opus-4-6" => "claude-opus-4-6@default",
        "claude-opus-4-5" => "claude-opus-4-5@20251101",
        "claude-sonnet-4-5" => "claude-sonnet-4-5@20250929",
        "claude-haiku-4-5" => "claude-haiku-4-5@20251001",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn vertex_model_mapping() {
        assert_eq!(map_to_vertex_model("claude-opus-4-6"), "claude-opus-4-6@default");
        assert_eq!(map_to_vertex_model("claude-opus-4-5"), "claude-opus-4-5@20251101");
        assert_eq!(map_to_vertex_model("claude-sonnet-4-5"), "claude-sonnet-4-5@20250929");
        assert_eq!(map_to_vertex_model("claude-haiku-4-5"), "claude-haiku-4-5@20251001");
    }

    #[test]
    fn vertex_model_mapping_passes_unknown_through() {
        assert_eq!(map_to_vertex_model("claude-3-opus"), "claude-3-opus");
        assert_eq!(map_to_vertex_model("Claude-Opus-4-5"), "Claude-Opus-4-5");
        assert_eq!(map_to_vertex_model(""), "");
    }

    #[test]
    fn api_key_mode() {
        let mode = resolve_auth(env(&[("ANTHROPIC_API_KEY", "sk-test")])).unwrap();
        assert_eq!(mode, AuthMode::ApiKey("sk-test".into()));
        assert_eq!(mode.model_id("claude-opus-4-5"), "claude-opus-4-5");
    }

    #[test]
    fn nothing_configured() {
        assert_eq!(resolve_auth(env(&[])), Err(AuthError::NotConfigured));
        assert_eq!(
            resolve_auth(env(&[("ANTHROPIC_API_KEY", "  ")])),
            Err(AuthError::NotConfigured)
        );
    }

    #[test]
    fn vertex_requires_each_variable() {
        assert_eq!(
            resolve_auth(env(&[("CLAUDE_CODE_USE_VERTEX", "1")])),
            Err(AuthError::MissingCredentialsPath)
        );
        assert_eq!(
            resolve_auth(env(&[
                ("CLAUDE_CODE_USE_VERTEX", "1"),
                ("GOOGLE_APPLICATION_CREDENTIALS", "/tmp/x.json"),
            ])),
            Err(AuthError::MissingProject)
        );
        assert_eq!(
            resolve_auth(env(&[
                ("CLAUDE_CODE_USE_VERTEX", "1"),
                ("GOOGLE_APPLICATION_CREDENTIALS", "/tmp/x.json"),
                ("ANTHROPIC_VERTEX_PROJECT_ID", "proj"),
            ])),
            Err(AuthError::MissingRegion)
        );
    }

    #[test]
    fn vertex_requires_existing_key_file() {
        let err = resolve_auth(env(&[
            ("CLAUDE_CODE_USE_VERTEX", "1"),
            ("GOOGLE_APPLICATION_CREDENTIALS", "/definitely/not/here.json"),
            ("ANTHROPIC_VERTEX_PROJECT_ID", "proj"),
            ("CLOUD_ML_REGION", "us-east5"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Service account key file not found at /definitely/not/here.json"
        );
    }

    #[test]
    fn vertex_mode_wins_and_clears_api_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let key_file = dir.path().join("sa.json");
        std::fs::write(&key_file, "{}").unwrap();
        let key_path = key_file.to_string_lossy().to_string();

        let mode = resolve_auth(env(&[
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("CLAUDE_CODE_USE_VERTEX", "1"),
            ("GOOGLE_APPLICATION_CREDENTIALS", key_path.as_str()),
            ("ANTHROPIC_VERTEX_PROJECT_ID", "proj"),
            ("CLOUD_ML_REGION", "us-east5"),
        ]))
        .unwrap();
        assert!(mode.is_vertex());
        assert_eq!(mode.model_id("claude-sonnet-4-5"), "claude-sonnet-4-5@20250929");

        let mut child_env = HashMap::from([("ANTHROPIC_API_KEY".to_string(), "x".to_string())]);
        let removed = mode.apply(&mut child_env);
        assert_eq!(removed, vec!["ANTHROPIC_API_KEY"]);
        assert!(!child_env.contains_key("ANTHROPIC_API_KEY"));
        assert_eq!(child_env["CLOUD_ML_REGION"], "us-east5");
    }
}
