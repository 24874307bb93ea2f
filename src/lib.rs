//! # Hook Sandbox
//!
//! Fetches small third-party UI scripts ("hooks") from a repository host at
//! request time, compiles them, and runs them in a V8 isolate to produce a
//! UI element tree.
//!
//! ## Security Guarantees
//!
//! - **Capability object only**: hooks reach the host solely through the
//!   `HookContext` they are called with
//! - **No native module loading**: `import()` is rewritten to an injected
//!   router that only loads from the configured host
//! - **Allowlisted `require`**: the UI runtime and the styling runtime, nothing else
//! - **No fs, env or timers**: none of the Deno web/runtime APIs are installed
//! - **Frozen intrinsics**: one hook cannot patch `JSON`, prototypes or the
//!   sandbox's own entry points under a later hook
//! - **Bounded**: heap and wall-clock limits per isolate; hitting either fails
//!   the load, not the session
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hook_sandbox::{HookRuntime, LoadStatus, RuntimeConfig, MAX_RENDER_DEPTH};
//! use std::collections::BTreeMap;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = HookRuntime::connect(RuntimeConfig::for_host("git.example.org"))?;
//!     let path = runtime.default_entry().await?;
//!
//!     match runtime.request(&path, &BTreeMap::new()).await {
//!         LoadStatus::Loaded(hook) | LoadStatus::Cached(hook) => {
//!             println!("{}", hook.element.render_outline(MAX_RENDER_DEPTH)?);
//!         }
//!         other => eprintln!("{:?}", other),
//!     }
//!     Ok(())
//! }
//! ```

mod compile;
mod config;
mod context;
mod diagnostics;
mod element;
mod error;
mod fetch;
mod loader;
pub mod logging;
mod manifest;
mod ops;
mod orchestrator;
mod pipeline;
mod resolver;
mod runtime;
mod sandbox;
mod sanitize;
#[cfg(test)]
mod testutil;

pub use compile::{rewrite_compiled, CompileError, CompileGateway, HttpCompileGateway, PassthroughCompiler};
pub use config::{ConfigError, Protocol, RetryPolicy, RuntimeConfig, SandboxConfig};
pub use context::{ContextSpec, HostEffects, SessionState};
pub use diagnostics::{DiagnosticEvent, Diagnostics};
pub use element::{Element, Node, RenderError, FILE_RENDERER, MAX_RENDER_DEPTH};
pub use error::{Failure, HookError, Phase};
pub use fetch::{FetchConfig, FetchError, HttpFetcher, SourceFetcher};
pub use loader::{HookLoader, LoadHook, LoadKey, LoadedHook};
pub use manifest::{HookManifest, DEFAULT_ROLE};
pub use ops::ConsoleOutput;
pub use orchestrator::{LoadOrchestrator, LoadStatus, RetrySnapshot};
pub use resolver::{resolve_reference, DelegateContext, DelegatedModule, ModuleDelegate};
pub use runtime::HookRuntime;
pub use sandbox::{HookSandbox, ModuleSummary};
pub use sanitize::{fix_mojibake, sanitize_params};
