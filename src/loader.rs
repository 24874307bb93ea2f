//! Hook Loader - one end-to-end load of an entry hook.
//!
//! fetch -> sanitize/compile -> context -> execute -> invoke. Every step tags
//! its own failure, and the loader binds it to the host and path it belongs
//! to. Retry and caching policy live one layer up in the orchestrator.

use crate::context::{ContextSpec, HostEffects, SessionState};
use crate::element::Element;
use crate::error::{snippet, Failure, HookError, Phase, SNIPPET_CHARS};
use crate::ops::ConsoleOutput;
use crate::pipeline::SourcePipeline;
use crate::sandbox::HookSandbox;
use crate::sanitize::sanitize_params;
use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identifies one load/retry lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub host: String,
    pub path: String,
}

impl LoadKey {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for LoadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedHook {
    pub element: Element,
    /// Navigation, branch and theme requests the hook made while loading.
    pub effects: HostEffects,
    pub console: ConsoleOutput,
    pub load_id: Uuid,
    /// base64 SHA-256 of the fetched entry source.
    pub source_digest: String,
}

#[async_trait(?Send)]
pub trait LoadHook {
    async fn load(
        &self,
        key: &LoadKey,
        params: &BTreeMap<String, String>,
    ) -> Result<LoadedHook, HookError>;
}

pub struct HookLoader {
    pipeline: Rc<SourcePipeline>,
    session: Rc<RefCell<SessionState>>,
    sandbox: Mutex<HookSandbox>,
    theme_styles: bool,
}

impl HookLoader {
    pub fn new(
        pipeline: Rc<SourcePipeline>,
        session: Rc<RefCell<SessionState>>,
        sandbox: HookSandbox,
        theme_styles: bool,
    ) -> Self {
        Self {
            pipeline,
            session,
            sandbox: Mutex::new(sandbox),
            theme_styles,
        }
    }

    async fn load_inner(
        &self,
        key: &LoadKey,
        params: &BTreeMap<String, String>,
    ) -> Result<LoadedHook, Failure> {
        let (url, headers) = {
            let session = self.session.borrow();
            let url = session
                .url_for(&key.host, &key.path)
                .map_err(|e| Failure::Fetch {
                    url: format!("{}{}", key.host, key.path),
                    status: None,
                    message: e.to_string(),
                })?;
            (url, session.repo_headers())
        };

        let source = self.pipeline.fetch(&url, &key.path, &headers).await?;
        let compiled = self.pipeline.compile(&source, &key.path).await?;

        sanitize_params(params).map_err(|e| Failure::execute(format!("invalid params: {}", e)))?;
        let spec = ContextSpec {
            host: key.host.clone(),
            path: key.path.clone(),
            params: params.clone(),
            theme_styles: self.theme_styles,
        };

        // One hook at a time per isolate; nested imports run inside this lock.
        let mut sandbox = self.sandbox.lock().await;
        sandbox.reset_effects();

        let summary = sandbox.execute(&compiled, &key.path)?;
        if !summary.default_callable {
            return Err(Failure::Execute {
                message: format!("{}: default export missing or not callable", key.path),
                export_keys: summary.keys,
                snippet: Some(snippet(&compiled, SNIPPET_CHARS)),
            });
        }

        let element = sandbox.invoke_default(&spec).await?;
        let (effects, console) = sandbox.take_effects();

        Ok(LoadedHook {
            element,
            effects,
            console,
            load_id: Uuid::new_v4(),
            source_digest: base64::engine::general_purpose::STANDARD
                .encode(Sha256::digest(source.as_bytes())),
        })
    }
}

#[async_trait(?Send)]
impl LoadHook for HookLoader {
    async fn load(
        &self,
        key: &LoadKey,
        params: &BTreeMap<String, String>,
    ) -> Result<LoadedHook, HookError> {
        let diagnostics = self.pipeline.diagnostics();
        match self.load_inner(key, params).await {
            Ok(loaded) => {
                diagnostics.ok(
                    Phase::Execute,
                    &key.path,
                    format!("hook produced an element (load {})", loaded.load_id),
                );
                Ok(loaded)
            }
            Err(failure) => {
                // Fetch, compile and resolve already reported where they happened.
                if failure.phase() == Phase::Execute {
                    diagnostics.failed(Phase::Execute, &key.path, failure.to_string());
                }
                Err(HookError::new(key.host.clone(), key.path.clone(), failure))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::PassthroughCompiler;
    use crate::config::RuntimeConfig;
    use crate::diagnostics::Diagnostics;
    use crate::resolver::{DelegateContext, DelegatedModule, ImportResolver, ModuleDelegate};
    use crate::testutil::{FailingCompiler, MemoryFetcher};

    const HOST: &str = "git.example.org";

    struct Fixture {
        loader: HookLoader,
        resolver: Rc<ImportResolver>,
        diagnostics: Diagnostics,
    }

    fn fixture(fetcher: Rc<MemoryFetcher>, compiler: Rc<dyn crate::compile::CompileGateway>) -> Fixture {
        let config = RuntimeConfig::for_host(HOST);
        let session = Rc::new(RefCell::new(SessionState::from_config(&config)));
        let diagnostics = Diagnostics::new();
        let pipeline = Rc::new(SourcePipeline::new(fetcher, compiler, diagnostics.clone()));
        let resolver = Rc::new(ImportResolver::new(pipeline.clone(), session.clone()));
        let sandbox = HookSandbox::new(&config.sandbox, resolver.clone(), session.clone()).unwrap();
        Fixture {
            loader: HookLoader::new(pipeline, session, sandbox, true),
            resolver,
            diagnostics,
        }
    }

    fn key(path: &str) -> LoadKey {
        LoadKey::new(HOST, path)
    }

    #[tokio::test]
    async fn test_loads_entry_hook() {
        let source = "export default function Get({ createElement, params }) {\n  return createElement('h1', null, 'hi ', params.name);\n}\n";
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/get.jsx", source));
        let fx = fixture(fetcher, Rc::new(PassthroughCompiler));
        let params = BTreeMap::from([("name".to_string(), "ada".to_string())]);

        let loaded = fx.loader.load(&key("/hooks/get.jsx"), &params).await.unwrap();
        assert_eq!(loaded.element.text_content(), "hi ada");
        assert_eq!(
            loaded.source_digest,
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(source.as_bytes()))
        );
        assert!(fx.diagnostics.failures().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_tagged() {
        let fx = fixture(Rc::new(MemoryFetcher::new()), Rc::new(PassthroughCompiler));
        let err = fx
            .loader
            .load(&key("/hooks/missing.jsx"), &BTreeMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Phase::Fetch);
        assert_eq!(err.host, HOST);
        assert_eq!(err.path, "/hooks/missing.jsx");
        assert!(matches!(err.failure, Failure::Fetch { status: Some(404), .. }));
    }

    #[tokio::test]
    async fn test_compile_failure_is_tagged() {
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/get.jsx", "<div"));
        let fx = fixture(fetcher, Rc::new(FailingCompiler("get.jsx:1:5 unexpected end".into())));

        let err = fx.loader.load(&key("/hooks/get.jsx"), &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.phase(), Phase::Compile);
        assert!(err.to_string().contains("get.jsx:1:5 unexpected end"));
    }

    #[tokio::test]
    async fn test_missing_default_export_lists_keys() {
        let fetcher = Rc::new(
            MemoryFetcher::new().with("/hooks/get.jsx", "export function Get() { return 'x'; }"),
        );
        let fx = fixture(fetcher, Rc::new(PassthroughCompiler));

        let err = fx.loader.load(&key("/hooks/get.jsx"), &BTreeMap::new()).await.unwrap_err();
        match err.failure {
            Failure::Execute {
                message,
                export_keys,
                snippet,
            } => {
                assert!(message.contains("default export missing or not callable"));
                assert_eq!(export_keys, vec!["Get".to_string()]);
                assert!(snippet.unwrap().starts_with("function Get()"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(fx.diagnostics.failures()[0].phase, Phase::Execute);
    }

    #[tokio::test]
    async fn test_dangerous_params_are_rejected() {
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/get.jsx", "export default () => 1;"));
        let fx = fixture(fetcher, Rc::new(PassthroughCompiler));
        let params = BTreeMap::from([("__proto__".to_string(), "x".to_string())]);

        let err = fx.loader.load(&key("/hooks/get.jsx"), &params).await.unwrap_err();
        assert_eq!(err.phase(), Phase::Execute);
        assert!(err.to_string().contains("invalid params"));
    }

    struct DummyDelegate;

    #[async_trait(?Send)]
    impl ModuleDelegate for DummyDelegate {
        async fn load_module(
            &self,
            reference: &str,
            _from_path: &str,
            _context: &DelegateContext,
        ) -> anyhow::Result<DelegatedModule> {
            anyhow::ensure!(reference == "./dummy.mjs", "unexpected reference {}", reference);
            Ok(DelegatedModule::Compiled("export default () => 'ok';".into()))
        }
    }

    #[tokio::test]
    async fn test_dynamic_import_goes_through_delegate() {
        let source = "export default function Foo(){ const m = await import('./dummy.mjs'); return m.default() }";
        let fetcher = Rc::new(MemoryFetcher::new().with("/hooks/get.jsx", source));
        let fx = fixture(fetcher.clone(), Rc::new(PassthroughCompiler));
        fx.resolver.set_load_module_delegate(Some(Rc::new(DummyDelegate)));

        let loaded = fx.loader.load(&key("/hooks/get.jsx"), &BTreeMap::new()).await.unwrap();
        assert_eq!(loaded.element, Element::text("ok"));
        assert_eq!(fetcher.total_hits(), 1);
    }

    #[tokio::test]
    async fn test_effects_are_per_load() {
        let fetcher = Rc::new(
            MemoryFetcher::new()
                .with("/hooks/nav.jsx", "export default ({ helpers }) => { helpers.navigate('/x'); console.warn('moved'); return null; };")
                .with("/hooks/quiet.jsx", "export default () => null;"),
        );
        let fx = fixture(fetcher, Rc::new(PassthroughCompiler));

        let first = fx.loader.load(&key("/hooks/nav.jsx"), &BTreeMap::new()).await.unwrap();
        assert_eq!(first.element, Element::Empty);
        assert_eq!(first.effects.navigations, vec!["/x".to_string()]);
        assert_eq!(first.console.warns, vec!["moved".to_string()]);

        let second = fx.loader.load(&key("/hooks/quiet.jsx"), &BTreeMap::new()).await.unwrap();
        assert!(second.effects.navigations.is_empty());
        assert!(second.console.warns.is_empty());
        assert_ne!(first.load_id, second.load_id);
    }
}
