//! Session state and the per-load HookContext description.
//!
//! The HookContext object itself is assembled inside the isolate by the
//! bootstrap. Rust decides what goes into it ([`ContextSpec`]) and owns the
//! state its helpers act on ([`SessionState`], [`HostEffects`]).

use crate::config::{Protocol, RuntimeConfig};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Per-session connection state. Shared between the loader, the resolver
/// and the ops backing `helpers.*`.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub host: String,
    pub protocol: Protocol,
    pub module_base_dir: String,
    pub branch: Option<String>,
    pub branch_header: String,
    pub repo_headers: BTreeMap<String, String>,
}

impl SessionState {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            host: config.host.clone(),
            protocol: config.protocol,
            module_base_dir: config.module_base_dir.clone(),
            branch: config.branch.clone(),
            branch_header: config.branch_header.clone(),
            repo_headers: config.repo_headers.clone(),
        }
    }

    /// Network address of a repository-relative path on `host`.
    pub fn url_for(&self, host: &str, path: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}://{}/{}",
            self.protocol.scheme(),
            host,
            path.trim_start_matches('/')
        ))
    }

    pub fn peer_url(&self, path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.protocol.scheme(),
            self.host,
            path.trim_start_matches('/')
        )
    }

    pub fn repo_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.repo_headers.clone();
        if let Some(branch) = &self.branch {
            headers.insert(self.branch_header.clone(), branch.clone());
        }
        headers
    }
}

/// What the isolate needs to build a fresh HookContext for one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSpec {
    pub host: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub theme_styles: bool,
}

/// Requests a hook made through its helpers during one load.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct HostEffects {
    pub navigations: Vec<String>,
    pub branch_changes: Vec<String>,
    pub theme_styles: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        let mut config = RuntimeConfig::for_host("git.example.org");
        config.repo_headers.insert("Accept".into(), "text/plain".into());
        SessionState::from_config(&config)
    }

    #[test]
    fn test_url_for_joins_host_and_path() {
        let url = session().url_for("git.example.org", "/hooks/get.jsx").unwrap();
        assert_eq!(url.as_str(), "https://git.example.org/hooks/get.jsx");
    }

    #[test]
    fn test_peer_url() {
        assert_eq!(
            session().peer_url("alice/notes/README.md"),
            "https://git.example.org/alice/notes/README.md"
        );
    }

    #[test]
    fn test_repo_headers_include_branch_once_set() {
        let mut session = session();
        assert_eq!(session.repo_headers().len(), 1);

        session.branch = Some("dev".into());
        let headers = session.repo_headers();
        assert_eq!(headers.get("X-Repo-Branch").map(String::as_str), Some("dev"));
        assert_eq!(headers.get("Accept").map(String::as_str), Some("text/plain"));
    }
}
