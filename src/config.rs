//! Runtime configuration.
//!
//! Everything has a default so a bare `RuntimeConfig { host, ..Default::default() }`
//! is usable. The binary can also read the same structure from a TOML file.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Automatic retry policy applied per load key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failures after which automatic retries stop.
    pub max_attempts: u32,
    /// Minimum time between two automatic attempts for the same key.
    pub min_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_interval_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Limits and surface of the V8 sandbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for one hook invocation in milliseconds (default: 30000ms)
    pub timeout_ms: Option<u64>,
    /// Extra name the styling runtime resolves under, besides `hook-styles`.
    pub styling_alias: String,
    /// Expose `helpers.registerThemeStyles` to hooks.
    pub allow_theme_registration: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024),
            timeout_ms: Some(30_000),
            styling_alias: String::from("@emotion/react"),
            allow_theme_registration: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Repository host, optionally with port (e.g. `git.example.org:8443`).
    pub host: String,
    pub protocol: Protocol,
    /// Directory bare module references are rooted at.
    pub module_base_dir: String,
    /// Path of the hook capability manifest on the host.
    pub manifest_path: String,
    /// Compile service endpoint. `None` means the host serves executable text.
    pub compile_url: Option<String>,
    /// Branch sent with every fetch until a hook changes it.
    pub branch: Option<String>,
    pub branch_header: String,
    /// Static headers included in `buildRepoHeaders()` and source fetches.
    pub repo_headers: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            protocol: Protocol::default(),
            module_base_dir: String::from("/hooks"),
            manifest_path: String::from("/.well-known/hooks.json"),
            compile_url: None,
            branch: None,
            branch_header: String::from("X-Repo-Branch"),
            repo_headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.host.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "host '{}' must not contain a scheme or path",
                self.host
            )));
        }
        if !self.module_base_dir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "module_base_dir '{}' must be absolute",
                self.module_base_dir
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// `<protocol>://<host>` with no trailing slash.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.host)
    }
}
