//! Fetch, sanitize and compile one unit of hook source.
//!
//! Shared by the hook loader (entry hooks) and the import resolver (nested
//! modules) so both tag failures and report diagnostics the same way.

use crate::compile::{rewrite_compiled, CompileError, CompileGateway};
use crate::diagnostics::Diagnostics;
use crate::error::{snippet, Failure, Phase, SNIPPET_CHARS};
use crate::fetch::SourceFetcher;
use crate::sanitize::fix_mojibake;
use std::collections::BTreeMap;
use std::rc::Rc;
use url::Url;

pub struct SourcePipeline {
    fetcher: Rc<dyn SourceFetcher>,
    compiler: Rc<dyn CompileGateway>,
    diagnostics: Diagnostics,
}

impl SourcePipeline {
    pub fn new(
        fetcher: Rc<dyn SourceFetcher>,
        compiler: Rc<dyn CompileGateway>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            fetcher,
            compiler,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub async fn fetch(
        &self,
        url: &Url,
        path: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, Failure> {
        match self.fetcher.fetch_text(url, headers).await {
            Ok(source) => {
                self.diagnostics
                    .ok(Phase::Fetch, path, format!("fetched {} bytes from {}", source.len(), url));
                Ok(source)
            }
            Err(err) => {
                let failure = Failure::Fetch {
                    url: url.to_string(),
                    status: err.status(),
                    message: err.to_string(),
                };
                self.diagnostics.failed(Phase::Fetch, path, failure.to_string());
                Err(failure)
            }
        }
    }

    /// Sanitize, compile through the gateway and rewrite into a function body.
    pub async fn compile(&self, source: &str, filename: &str) -> Result<String, Failure> {
        let source = fix_mojibake(source);
        match self.compiler.compile(&source, filename).await {
            Ok(compiled) => {
                let rewritten = rewrite_compiled(&compiled);
                self.diagnostics.ok(
                    Phase::Compile,
                    filename,
                    format!("compiled {} bytes", rewritten.len()),
                );
                Ok(rewritten)
            }
            Err(err) => {
                let diagnostic = match err {
                    CompileError::Diagnostic(text) => text,
                    unavailable => unavailable.to_string(),
                };
                let failure = Failure::Compile {
                    filename: filename.to_string(),
                    diagnostic,
                    snippet: snippet(&source, SNIPPET_CHARS),
                };
                self.diagnostics
                    .failed(Phase::Compile, filename, failure.to_string());
                Err(failure)
            }
        }
    }

    /// Compile text that was handed over already compiled (delegate output).
    pub fn rewrite_only(&self, compiled: &str) -> String {
        rewrite_compiled(compiled)
    }
}
