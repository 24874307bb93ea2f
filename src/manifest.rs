//! Hook discovery manifest advertised by a host.
//!
//! ```json
//! { "hooks": { "get": "/hooks/get.jsx", "query": "/hooks/query.jsx" } }
//! ```

use crate::context::SessionState;
use crate::error::Failure;
use crate::pipeline::SourcePipeline;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Role used when a load names no entry path.
pub const DEFAULT_ROLE: &str = "get";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HookManifest {
    #[serde(default)]
    pub hooks: BTreeMap<String, String>,
}

impl HookManifest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Fetch and parse the manifest at `manifest_path` on the session host.
    pub async fn fetch(
        pipeline: &SourcePipeline,
        session: &SessionState,
        manifest_path: &str,
    ) -> Result<Self, Failure> {
        let url = session
            .url_for(&session.host, manifest_path)
            .map_err(|e| Failure::Fetch {
                url: format!("{}{}", session.host, manifest_path),
                status: None,
                message: e.to_string(),
            })?;
        let text = pipeline
            .fetch(&url, manifest_path, &session.repo_headers())
            .await?;
        Self::parse(&text).map_err(|e| Failure::Fetch {
            url: url.to_string(),
            status: None,
            message: format!("malformed hook manifest: {}", e),
        })
    }

    /// Repository-relative path for `role`, always with a leading slash.
    pub fn entry_for(&self, role: &str) -> Option<String> {
        let path = self.hooks.get(role)?.trim();
        if path.is_empty() {
            return None;
        }
        Some(format!("/{}", path.trim_start_matches('/')))
    }
}
