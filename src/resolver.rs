//! Import resolution for modules referenced from inside running hooks.
//!
//! A reference seen in a module at `from_path` resolves like this:
//! - `./x` and `../x` are relative to the directory of `from_path`
//! - `/x` is absolute on the configured host
//! - anything else is rooted at the module base directory
//! - URLs (`https:`, `data:`, `blob:`, ...) are refused
//!
//! Compiled units are cached per resolved path for the lifetime of the
//! resolver (one session). The cache holds the in-progress future from the
//! moment resolution begins, so overlapping and circular references wait on
//! the same work instead of starting it again.

use crate::context::SessionState;
use crate::error::{Failure, Phase};
use crate::pipeline::SourcePipeline;
use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type PendingUnit = Shared<LocalBoxFuture<'static, Result<String, Failure>>>;

/// What an installed delegate knows about the session it serves.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateContext {
    pub host: String,
    pub branch: Option<String>,
}

/// Module produced by a delegate instead of the host pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegatedModule {
    /// Hook source; goes through sanitize, compile and rewrite.
    Source(String),
    /// Already executable text; only rewritten.
    Compiled(String),
    /// Plain data used as the exports object as-is.
    Exports(Value),
}

/// Replaces the default fetch/compile pipeline for nested modules.
#[async_trait(?Send)]
pub trait ModuleDelegate {
    async fn load_module(
        &self,
        reference: &str,
        from_path: &str,
        context: &DelegateContext,
    ) -> anyhow::Result<DelegatedModule>;
}

/// Unit handed to the isolate for one import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModuleUnit {
    Source {
        path: String,
        code: String,
    },
    Exports {
        value: Value,
    },
    Failed {
        reference: String,
        #[serde(rename = "fromPath")]
        from_path: String,
        cause: String,
    },
}

/// Cache key for a reference, or why there is none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub key: Option<String>,
    pub error: Option<String>,
}

/// Resolve `reference` seen in the module at `from_path`.
pub fn resolve_reference(reference: &str, from_path: &str, base_dir: &str) -> Result<String, String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err("empty module reference".into());
    }
    if reference.contains("://") || reference.starts_with("data:") || reference.starts_with("blob:") {
        return Err(format!("remote imports are forbidden: {}", reference));
    }

    let joined = if reference.starts_with("./") || reference.starts_with("../") {
        let dir = match from_path.rfind('/') {
            Some(idx) => &from_path[..=idx],
            None => "/",
        };
        format!("{dir}{reference}")
    } else if reference.starts_with('/') {
        reference.to_string()
    } else {
        format!("{}/{}", base_dir.trim_end_matches('/'), reference)
    };

    normalize(&joined).ok_or_else(|| format!("'{}' escapes the host root", reference))
}

fn normalize(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(format!("/{}", segments.join("/")))
}

pub struct ImportResolver {
    pipeline: Rc<SourcePipeline>,
    session: Rc<RefCell<SessionState>>,
    delegate: RefCell<Option<Rc<dyn ModuleDelegate>>>,
    units: RefCell<HashMap<String, PendingUnit>>,
}

impl ImportResolver {
    pub fn new(pipeline: Rc<SourcePipeline>, session: Rc<RefCell<SessionState>>) -> Self {
        Self {
            pipeline,
            session,
            delegate: RefCell::new(None),
            units: RefCell::new(HashMap::new()),
        }
    }

    /// Install (or with `None`, remove) a delegate that takes precedence over
    /// the fetch/compile pipeline.
    pub fn set_load_module_delegate(&self, delegate: Option<Rc<dyn ModuleDelegate>>) {
        *self.delegate.borrow_mut() = delegate;
    }

    pub fn resolve(&self, reference: &str, from_path: &str) -> Result<String, String> {
        let base_dir = self.session.borrow().module_base_dir.clone();
        resolve_reference(reference, from_path, &base_dir)
    }

    /// Key the isolate caches executed exports under.
    ///
    /// With a delegate installed, references that do not resolve to a host
    /// path are keyed by the reference itself and left to the delegate.
    pub fn cache_key(&self, reference: &str, from_path: &str) -> Resolution {
        match self.resolve(reference, from_path) {
            Ok(path) => Resolution {
                key: Some(path),
                error: None,
            },
            Err(_) if self.delegate.borrow().is_some() => Resolution {
                key: Some(format!("delegate:{}", reference)),
                error: None,
            },
            Err(cause) => {
                let failure = Failure::Resolve {
                    reference: reference.to_string(),
                    from_path: from_path.to_string(),
                    cause,
                };
                self.pipeline
                    .diagnostics()
                    .failed(Phase::Resolve, from_path, failure.to_string());
                Resolution {
                    key: None,
                    error: Some(failure.to_string()),
                }
            }
        }
    }

    /// Produce the unit for `reference`; failures come back as
    /// [`ModuleUnit::Failed`] so the isolate can raise a tagged error.
    pub async fn load_unit(&self, reference: &str, from_path: &str, key: &str) -> ModuleUnit {
        let delegate = self.delegate.borrow().clone();
        let result = match delegate {
            Some(delegate) => self.load_via_delegate(delegate, reference, from_path, key).await,
            None => self.load_via_host(key).await,
        };

        let diagnostics = self.pipeline.diagnostics();
        match result {
            Ok(unit) => {
                diagnostics.ok(
                    Phase::Resolve,
                    key,
                    format!("resolved '{}' from {}", reference, from_path),
                );
                unit
            }
            Err(cause) => {
                let failure = Failure::Resolve {
                    reference: reference.to_string(),
                    from_path: from_path.to_string(),
                    cause: cause.clone(),
                };
                diagnostics.failed(Phase::Resolve, from_path, failure.to_string());
                ModuleUnit::Failed {
                    reference: reference.to_string(),
                    from_path: from_path.to_string(),
                    cause,
                }
            }
        }
    }

    async fn load_via_delegate(
        &self,
        delegate: Rc<dyn ModuleDelegate>,
        reference: &str,
        from_path: &str,
        key: &str,
    ) -> Result<ModuleUnit, String> {
        let context = {
            let session = self.session.borrow();
            DelegateContext {
                host: session.host.clone(),
                branch: session.branch.clone(),
            }
        };
        let module = delegate
            .load_module(reference, from_path, &context)
            .await
            .map_err(|e| format!("delegate failed: {:#}", e))?;

        match module {
            DelegatedModule::Exports(value) => Ok(ModuleUnit::Exports { value }),
            DelegatedModule::Compiled(code) => Ok(ModuleUnit::Source {
                path: key.to_string(),
                code: self.pipeline.rewrite_only(&code),
            }),
            DelegatedModule::Source(source) => {
                let code = self
                    .pipeline
                    .compile(&source, key)
                    .await
                    .map_err(|f| f.to_string())?;
                Ok(ModuleUnit::Source {
                    path: key.to_string(),
                    code,
                })
            }
        }
    }

    async fn load_via_host(&self, path: &str) -> Result<ModuleUnit, String> {
        let pending = self.pending_unit(path)?;
        let result = pending.clone().await;
        if result.is_err() {
            // Only successful units stay cached; a later attempt refetches.
            let mut units = self.units.borrow_mut();
            if units.get(path).is_some_and(|current| current.ptr_eq(&pending)) {
                units.remove(path);
            }
        }
        result
            .map(|code| ModuleUnit::Source {
                path: path.to_string(),
                code,
            })
            .map_err(|failure| failure.to_string())
    }

    fn pending_unit(&self, path: &str) -> Result<PendingUnit, String> {
        if let Some(pending) = self.units.borrow().get(path) {
            return Ok(pending.clone());
        }

        let (url, headers) = {
            let session = self.session.borrow();
            let url = session
                .url_for(&session.host, path)
                .map_err(|e| format!("invalid module address for {}: {}", path, e))?;
            (url, session.repo_headers())
        };

        let pipeline = self.pipeline.clone();
        let owned_path = path.to_string();
        let pending = async move {
            let source = pipeline.fetch(&url, &owned_path, &headers).await?;
            pipeline.compile(&source, &owned_path).await
        }
        .boxed_local()
        .shared();

        self.units
            .borrow_mut()
            .insert(path.to_string(), pending.clone());
        Ok(pending)
    }

    /// Resolved paths with a compiled unit cached or in progress.
    pub fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.units.borrow().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::PassthroughCompiler;
    use crate::config::RuntimeConfig;
    use crate::diagnostics::Diagnostics;
    use crate::testutil::MemoryFetcher;

    fn resolver_with(fetcher: Rc<MemoryFetcher>) -> ImportResolver {
        let config = RuntimeConfig::for_host("git.example.org");
        let session = Rc::new(RefCell::new(SessionState::from_config(&config)));
        let pipeline = Rc::new(SourcePipeline::new(
            fetcher,
            Rc::new(PassthroughCompiler),
            Diagnostics::new(),
        ));
        ImportResolver::new(pipeline, session)
    }

    #[test]
    fn test_relative_reference_resolves_against_directory() {
        assert_eq!(
            resolve_reference("./x.jsx", "/hooks/client/get-client.jsx", "/hooks").unwrap(),
            "/hooks/client/x.jsx"
        );
        assert_eq!(
            resolve_reference("../shared/y.jsx", "/hooks/client/get-client.jsx", "/hooks").unwrap(),
            "/hooks/shared/y.jsx"
        );
    }

    #[test]
    fn test_bare_and_absolute_references() {
        assert_eq!(
            resolve_reference("lib/util.jsx", "/hooks/client/get.jsx", "/hooks").unwrap(),
            "/hooks/lib/util.jsx"
        );
        assert_eq!(
            resolve_reference("/shared/util.jsx", "/hooks/client/get.jsx", "/hooks").unwrap(),
            "/shared/util.jsx"
        );
    }

    #[test]
    fn test_rejects_remote_and_escaping_references() {
        let err = resolve_reference("https://evil.com/payload.js", "/hooks/get.jsx", "/hooks").unwrap_err();
        assert!(err.contains("remote imports are forbidden"));

        assert!(resolve_reference("data:text/javascript,1", "/hooks/get.jsx", "/hooks").is_err());
        assert!(resolve_reference("../../../etc/passwd", "/hooks/get.jsx", "/hooks").is_err());
        assert!(resolve_reference("", "/hooks/get.jsx", "/hooks").is_err());
    }

    #[test]
    fn test_cache_key_reports_reference_and_from_path() {
        let resolver = resolver_with(Rc::new(MemoryFetcher::new()));
        let resolution = resolver.cache_key("https://evil.com/x.js", "/hooks/get.jsx");
        assert_eq!(resolution.key, None);
        let error = resolution.error.unwrap();
        assert!(error.contains("https://evil.com/x.js"));
        assert!(error.contains("/hooks/get.jsx"));
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/lib/a.jsx", "export const a = 1;"));
        let resolver = resolver_with(fetcher.clone());

        let (first, second) = futures::join!(
            resolver.load_unit("./lib/a.jsx", "/hooks/get.jsx", "/hooks/lib/a.jsx"),
            resolver.load_unit("lib/a.jsx", "/hooks/other.jsx", "/hooks/lib/a.jsx"),
        );

        assert_eq!(first, second);
        assert!(matches!(first, ModuleUnit::Source { ref code, .. } if code.contains("exports.a = a;")));
        assert_eq!(fetcher.hits("/hooks/lib/a.jsx"), 1);

        // Finished units are never recomputed.
        resolver.load_unit("./lib/a.jsx", "/hooks/get.jsx", "/hooks/lib/a.jsx").await;
        assert_eq!(fetcher.hits("/hooks/lib/a.jsx"), 1);
        assert_eq!(resolver.cached_paths(), vec!["/hooks/lib/a.jsx".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_units_are_evicted() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let resolver = resolver_with(fetcher.clone());

        let unit = resolver.load_unit("./b.jsx", "/hooks/get.jsx", "/hooks/b.jsx").await;
        match unit {
            ModuleUnit::Failed { reference, from_path, cause } => {
                assert_eq!(reference, "./b.jsx");
                assert_eq!(from_path, "/hooks/get.jsx");
                assert!(cause.contains("404"));
            }
            other => panic!("unexpected unit: {other:?}"),
        }
        assert!(resolver.cached_paths().is_empty());

        fetcher.insert("/hooks/b.jsx", "export default 1");
        let unit = resolver.load_unit("./b.jsx", "/hooks/get.jsx", "/hooks/b.jsx").await;
        assert!(matches!(unit, ModuleUnit::Source { .. }));
        assert_eq!(fetcher.hits("/hooks/b.jsx"), 2);
    }

    struct StubDelegate;

    #[async_trait(?Send)]
    impl ModuleDelegate for StubDelegate {
        async fn load_module(
            &self,
            reference: &str,
            from_path: &str,
            context: &DelegateContext,
        ) -> anyhow::Result<DelegatedModule> {
            assert_eq!(context.host, "git.example.org");
            match reference {
                "./data.json" => Ok(DelegatedModule::Exports(serde_json::json!({"peers": 3}))),
                "npm:left-pad" => Ok(DelegatedModule::Compiled("export default 1;".into())),
                _ => anyhow::bail!("no stub for {} from {}", reference, from_path),
            }
        }
    }

    #[tokio::test]
    async fn test_delegate_takes_precedence() {
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/data.json", "{}"));
        let resolver = resolver_with(fetcher.clone());
        resolver.set_load_module_delegate(Some(Rc::new(StubDelegate)));

        let unit = resolver.load_unit("./data.json", "/hooks/get.jsx", "/hooks/data.json").await;
        assert_eq!(
            unit,
            ModuleUnit::Exports {
                value: serde_json::json!({"peers": 3})
            }
        );
        assert_eq!(fetcher.total_hits(), 0);

        let resolution = resolver.cache_key("npm:left-pad", "/hooks/get.jsx");
        assert_eq!(resolution.key.as_deref(), Some("/hooks/npm:left-pad"));
        let unit = resolver.load_unit("npm:left-pad", "/hooks/get.jsx", "/hooks/npm:left-pad").await;
        assert_eq!(
            unit,
            ModuleUnit::Source {
                path: "/hooks/npm:left-pad".into(),
                code: "exports.default = 1;".into()
            }
        );

        let unit = resolver.load_unit("./missing.jsx", "/hooks/get.jsx", "/hooks/missing.jsx").await;
        assert!(matches!(unit, ModuleUnit::Failed { ref cause, .. } if cause.contains("no stub for ./missing.jsx")));
    }
}
