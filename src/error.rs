//! Phase-tagged failures.
//!
//! Every stage of a load catches its own errors and returns a [`Failure`]
//! naming the phase it belongs to. The loader wraps it into a [`HookError`]
//! together with the host and path, so nothing crosses a component boundary
//! untagged.

use serde::Serialize;
use std::fmt;

/// Number of characters of source or compiled text kept in error snippets.
pub const SNIPPET_CHARS: usize = 200;

/// Pipeline phase a failure or diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Compile,
    Resolve,
    Execute,
    Render,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Compile => "compile",
            Phase::Resolve => "resolve",
            Phase::Execute => "execute",
            Phase::Render => "render",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong, with the detail each phase can offer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Failure {
    #[error("fetching {url} failed: {message}")]
    Fetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("compiling {filename} failed: {diagnostic}")]
    Compile {
        filename: String,
        diagnostic: String,
        snippet: String,
    },

    #[error("cannot load '{reference}' from {from_path}: {cause}")]
    Resolve {
        reference: String,
        from_path: String,
        cause: String,
    },

    #[error("{message}")]
    Execute {
        message: String,
        export_keys: Vec<String>,
        snippet: Option<String>,
    },

    #[error("rendering failed: {message}")]
    Render { message: String },
}

impl Failure {
    pub fn phase(&self) -> Phase {
        match self {
            Failure::Fetch { .. } => Phase::Fetch,
            Failure::Compile { .. } => Phase::Compile,
            Failure::Resolve { .. } => Phase::Resolve,
            Failure::Execute { .. } => Phase::Execute,
            Failure::Render { .. } => Phase::Render,
        }
    }

    pub fn execute(message: impl Into<String>) -> Self {
        Failure::Execute {
            message: message.into(),
            export_keys: Vec::new(),
            snippet: None,
        }
    }

    /// Raw diagnostic text for "show details" style surfaces.
    pub fn detail(&self) -> String {
        match self {
            Failure::Compile {
                diagnostic,
                snippet,
                ..
            } => format!("{diagnostic}\n--- source ---\n{snippet}"),
            Failure::Execute {
                message,
                export_keys,
                snippet,
            } => {
                let mut out = message.clone();
                if !export_keys.is_empty() {
                    out.push_str(&format!("\nexports: [{}]", export_keys.join(", ")));
                }
                if let Some(snippet) = snippet {
                    out.push_str("\n--- compiled ---\n");
                    out.push_str(snippet);
                }
                out
            }
            other => other.to_string(),
        }
    }
}

/// A failure bound to the load it happened in.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{}] {host}{path}: {failure}", .failure.phase())]
pub struct HookError {
    pub host: String,
    pub path: String,
    #[source]
    pub failure: Failure,
}

impl HookError {
    pub fn new(host: impl Into<String>, path: impl Into<String>, failure: Failure) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            failure,
        }
    }

    pub fn phase(&self) -> Phase {
        self.failure.phase()
    }
}

/// First `max` characters of `text`, on a char boundary.
pub fn snippet(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
