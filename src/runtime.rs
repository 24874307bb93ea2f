//! Hook runtime session - one per host connection.
//!
//! Owns everything with session lifetime: connection state, the import
//! resolver and its module caches, the V8 sandbox, the orchestrator and the
//! diagnostics trail. Sessions share nothing, so two hosts never see each
//! other's modules.

use crate::compile::{CompileGateway, HttpCompileGateway, PassthroughCompiler};
use crate::config::RuntimeConfig;
use crate::context::SessionState;
use crate::diagnostics::Diagnostics;
use crate::element::RenderError;
use crate::error::HookError;
use crate::fetch::{FetchConfig, HttpFetcher, SourceFetcher};
use crate::loader::{HookLoader, LoadKey};
use crate::manifest::{HookManifest, DEFAULT_ROLE};
use crate::orchestrator::{LoadOrchestrator, LoadStatus, RetrySnapshot};
use crate::pipeline::SourcePipeline;
use crate::resolver::{ImportResolver, ModuleDelegate};
use crate::sandbox::HookSandbox;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tokio::sync::OnceCell;
use url::Url;

pub struct HookRuntime {
    config: RuntimeConfig,
    session: Rc<RefCell<SessionState>>,
    pipeline: Rc<SourcePipeline>,
    resolver: Rc<ImportResolver>,
    orchestrator: LoadOrchestrator<HookLoader>,
    manifest: OnceCell<HookManifest>,
}

impl HookRuntime {
    /// Build a session from explicit fetch and compile collaborators.
    pub fn new(
        config: RuntimeConfig,
        fetcher: Rc<dyn SourceFetcher>,
        compiler: Rc<dyn CompileGateway>,
    ) -> Result<Self> {
        config.validate()?;

        let diagnostics = Diagnostics::new();
        let session = Rc::new(RefCell::new(SessionState::from_config(&config)));
        let pipeline = Rc::new(SourcePipeline::new(fetcher, compiler, diagnostics.clone()));
        let resolver = Rc::new(ImportResolver::new(pipeline.clone(), session.clone()));
        let sandbox = HookSandbox::new(&config.sandbox, resolver.clone(), session.clone())
            .context("failed to create hook sandbox")?;
        let loader = HookLoader::new(
            pipeline.clone(),
            session.clone(),
            sandbox,
            config.sandbox.allow_theme_registration,
        );
        let orchestrator = LoadOrchestrator::new(loader, config.retry.clone(), diagnostics);

        tracing::info!(
            target: "hook_sandbox",
            host = %config.host,
            base = %config.module_base_dir,
            "hook runtime ready"
        );

        Ok(Self {
            config,
            session,
            pipeline,
            resolver,
            orchestrator,
            manifest: OnceCell::new(),
        })
    }

    /// Build a session talking HTTP to the configured host and compile service.
    pub fn connect(config: RuntimeConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetchConfig {
            allowed_origins: vec![config.origin()],
        })?;

        let compiler: Rc<dyn CompileGateway> = match &config.compile_url {
            Some(endpoint) => {
                let endpoint = Url::parse(endpoint)
                    .with_context(|| format!("invalid compile_url '{}'", endpoint))?;
                Rc::new(HttpCompileGateway::new(endpoint)?)
            }
            None => Rc::new(PassthroughCompiler),
        };

        Self::new(config, Rc::new(fetcher), compiler)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.pipeline.diagnostics()
    }

    /// Branch currently sent with fetches (hooks may change it).
    pub fn branch(&self) -> Option<String> {
        self.session.borrow().branch.clone()
    }

    pub fn key(&self, path: &str) -> LoadKey {
        LoadKey::new(self.config.host.clone(), format!("/{}", path.trim_start_matches('/')))
    }

    /// Entry path advertised for the default role, fetched once per session.
    pub async fn default_entry(&self) -> Result<String, HookError> {
        let manifest_path = self.config.manifest_path.as_str();
        let bind = |failure| HookError::new(self.config.host.clone(), manifest_path, failure);

        let manifest = self
            .manifest
            .get_or_try_init(|| async {
                let session = self.session.borrow().clone();
                HookManifest::fetch(&self.pipeline, &session, manifest_path).await
            })
            .await
            .map_err(bind)?;

        manifest.entry_for(DEFAULT_ROLE).ok_or_else(|| {
            bind(crate::error::Failure::Fetch {
                url: format!("{}{}", self.config.origin(), manifest_path),
                status: None,
                message: format!("manifest has no '{}' hook", DEFAULT_ROLE),
            })
        })
    }

    pub async fn request(&self, path: &str, params: &BTreeMap<String, String>) -> LoadStatus {
        self.orchestrator.request(self.key(path), params).await
    }

    pub async fn retry(&self, path: &str, params: &BTreeMap<String, String>) -> LoadStatus {
        self.orchestrator.retry(self.key(path), params).await
    }

    /// The element loaded for `path` could not be rendered.
    pub fn report_render_failure(&self, path: &str, error: &RenderError) {
        self.orchestrator
            .report_render_failure(&self.key(path), error.to_string());
    }

    pub fn snapshot(&self, path: &str) -> RetrySnapshot {
        self.orchestrator.snapshot(&self.key(path))
    }

    /// Route nested module loads through `delegate` instead of the host.
    pub fn set_load_module_delegate(&self, delegate: Option<Rc<dyn ModuleDelegate>>) {
        self.resolver.set_load_module_delegate(delegate);
    }

    /// Resolved paths of nested modules cached in this session.
    pub fn cached_modules(&self) -> Vec<String> {
        self.resolver.cached_paths()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, MAX_RENDER_DEPTH};
    use crate::error::Phase;
    use crate::testutil::MemoryFetcher;

    fn runtime_with(fetcher: Rc<MemoryFetcher>) -> HookRuntime {
        HookRuntime::new(
            RuntimeConfig::for_host("git.example.org"),
            fetcher,
            Rc::new(PassthroughCompiler),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_same_key_fetches_once() {
        let fetcher = Rc::new(
            MemoryFetcher::new().with("/hooks/get.jsx", "export default () => 'hello';"),
        );
        let runtime = runtime_with(fetcher.clone());

        let first = runtime.request("/hooks/get.jsx", &BTreeMap::new()).await;
        let second = runtime.request("hooks/get.jsx", &BTreeMap::new()).await;

        assert!(matches!(first, LoadStatus::Loaded(_)));
        assert_eq!(second.hook().unwrap().element, Element::text("hello"));
        assert!(matches!(second, LoadStatus::Cached(_)));
        assert_eq!(fetcher.hits("/hooks/get.jsx"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_requests_fetch_once() {
        let fetcher = Rc::new(
            MemoryFetcher::new().with("/hooks/get.jsx", "export default () => 'hello';"),
        );
        let runtime = runtime_with(fetcher.clone());
        let params = BTreeMap::new();

        let (first, second) = futures::join!(
            runtime.request("/hooks/get.jsx", &params),
            runtime.request("/hooks/get.jsx", &params),
        );

        assert!(matches!(first, LoadStatus::Loaded(_)));
        assert!(matches!(second, LoadStatus::InFlight));
        assert_eq!(fetcher.hits("/hooks/get.jsx"), 1);
    }

    #[tokio::test]
    async fn test_default_entry_comes_from_manifest() {
        let fetcher = Rc::new(
            MemoryFetcher::new()
                .with("/.well-known/hooks.json", r#"{"hooks": {"get": "hooks/client/get-client.jsx"}}"#),
        );
        let runtime = runtime_with(fetcher.clone());

        assert_eq!(runtime.default_entry().await.unwrap(), "/hooks/client/get-client.jsx");
        assert_eq!(runtime.default_entry().await.unwrap(), "/hooks/client/get-client.jsx");
        assert_eq!(fetcher.hits("/.well-known/hooks.json"), 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_a_fetch_error() {
        let runtime = runtime_with(Rc::new(MemoryFetcher::new()));
        let err = runtime.default_entry().await.unwrap_err();
        assert_eq!(err.phase(), Phase::Fetch);
        assert_eq!(err.path, "/.well-known/hooks.json");
    }

    #[tokio::test]
    async fn test_set_branch_applies_to_later_fetches() {
        let fetcher = Rc::new(
            MemoryFetcher::new()
                .with(
                    "/hooks/get.jsx",
                    "export default async ({ helpers }) => { helpers.setBranch('dev'); return (await helpers.loadModule('./lib.jsx')).label; };",
                )
                .with("/hooks/lib.jsx", "export const label = 'lib';"),
        );
        let runtime = runtime_with(fetcher.clone());

        let status = runtime.request("/hooks/get.jsx", &BTreeMap::new()).await;
        let hook = status.hook().unwrap();
        assert_eq!(hook.element, Element::text("lib"));
        assert_eq!(hook.effects.branch_changes, vec!["dev".to_string()]);
        assert_eq!(runtime.branch().as_deref(), Some("dev"));
        assert_eq!(
            fetcher.last_headers().get("X-Repo-Branch").map(String::as_str),
            Some("dev")
        );
        assert_eq!(runtime.cached_modules(), vec!["/hooks/lib.jsx".to_string()]);
    }

    #[tokio::test]
    async fn test_render_failure_pauses_key() {
        let fetcher = Rc::new(
            MemoryFetcher::new().with("/hooks/get.jsx", "export default () => 'hello';"),
        );
        let runtime = runtime_with(fetcher.clone());

        runtime.request("/hooks/get.jsx", &BTreeMap::new()).await;
        runtime.report_render_failure("/hooks/get.jsx", &RenderError::EmptyType);

        let status = runtime.request("/hooks/get.jsx", &BTreeMap::new()).await;
        assert!(matches!(status, LoadStatus::Paused { attempts: 3, .. }));

        let status = runtime.retry("/hooks/get.jsx", &BTreeMap::new()).await;
        assert!(matches!(status, LoadStatus::Loaded(_)));
        assert_eq!(fetcher.hits("/hooks/get.jsx"), 2);
    }

    #[tokio::test]
    async fn test_too_deep_tree_becomes_a_render_failure() {
        let fetcher = Rc::new(MemoryFetcher::new().with(
            "/hooks/deep.jsx",
            "export default ({ createElement: h }) => {\n  let node = 'leaf';\n  for (let i = 0; i < 65; i++) node = h('div', null, node);\n  return node;\n};",
        ));
        let runtime = runtime_with(fetcher);

        let status = runtime.request("/hooks/deep.jsx", &BTreeMap::new()).await;
        let LoadStatus::Loaded(hook) = status else {
            panic!("expected the load to succeed, got {status:?}");
        };
        let err = hook.element.render_outline(MAX_RENDER_DEPTH).unwrap_err();
        assert_eq!(err, RenderError::TooDeep(MAX_RENDER_DEPTH));

        runtime.report_render_failure("/hooks/deep.jsx", &err);
        let snapshot = runtime.snapshot("/hooks/deep.jsx");
        assert_eq!(snapshot.attempts, runtime.config().retry.max_attempts);
        assert!(!snapshot.cached);
        assert_eq!(snapshot.last_error.map(|e| e.phase()), Some(Phase::Render));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = HookRuntime::new(
            RuntimeConfig::default(),
            Rc::new(MemoryFetcher::new()),
            Rc::new(PassthroughCompiler),
        );
        assert!(result.is_err());
    }
}
