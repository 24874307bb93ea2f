//! Module Execution Sandbox - runs compiled hook units in a V8 isolate.
//!
//! Provides only what hooks are allowed to touch:
//! - the exports object, an allowlisted `require` and the import router
//! - the HookContext helpers (navigation, branch, peer URLs, repo headers,
//!   theme registration, nested module loading)
//! - console.log/warn/error (captured, not printed)
//! - no fs, net, env, timers or native module loading

use crate::config::SandboxConfig;
use crate::context::{ContextSpec, HostEffects, SessionState};
use crate::element::Element;
use crate::error::{snippet, Failure, SNIPPET_CHARS};
use crate::ops::{hook_runtime, ActiveLoad, ConsoleOutput};
use crate::resolver::ImportResolver;
use deno_core::anyhow::{anyhow, Error};
use deno_core::{
    v8, JsRuntime, ModuleLoadResponse, ModuleLoader, ModuleSpecifier, PollEventLoopOptions,
    RequestedModuleType, ResolutionKind, RuntimeOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Rejects every native module request.
///
/// Hooks never load code through V8's module system; dynamic imports are
/// rewritten to the injected router before evaluation. Anything that slips
/// through ends up here and fails with a clear message.
pub struct BlockedModuleLoader;

impl ModuleLoader for BlockedModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        Err(anyhow!(
            "Native module loading is disabled in the hook sandbox: {}",
            specifier
        ))
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        ModuleLoadResponse::Sync(Err(anyhow!(
            "Native module loading is disabled in the hook sandbox: {}",
            module_specifier
        )))
    }
}

/// Exports summary of an executed entry unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSummary {
    pub keys: Vec<String>,
    pub default_callable: bool,
}

#[derive(Debug, Deserialize)]
struct JsFailure {
    phase: String,
    message: String,
    stack: Option<String>,
    reference: Option<String>,
    #[serde(rename = "fromPath")]
    from_path: Option<String>,
    cause: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
}

impl JsFailure {
    fn into_failure(self, path: &str) -> Failure {
        if self.phase == "resolve" {
            return Failure::Resolve {
                reference: self.reference.unwrap_or_default(),
                from_path: self.from_path.unwrap_or_else(|| path.to_string()),
                cause: self.cause.unwrap_or(self.message),
            };
        }
        Failure::Execute {
            message: format!("{}: {}", path, self.message),
            export_keys: self.keys,
            snippet: self.stack,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteOutcome {
    ok: bool,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    default_callable: bool,
    error: Option<JsFailure>,
}

#[derive(Debug, Deserialize)]
struct InvokeOutcome {
    ok: bool,
    #[serde(default)]
    element: serde_json::Value,
    error: Option<JsFailure>,
}

/// Terminates the isolate if an operation outlives its budget.
///
/// Runs on its own thread so a hook stuck in a synchronous loop cannot keep
/// it from firing.
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(runtime: &mut JsRuntime, timeout: Duration) -> Self {
        let isolate_handle = runtime.v8_isolate().thread_safe_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel, cancelled) = mpsc::channel::<()>();
        let flag = fired.clone();
        let thread = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                isolate_handle.terminate_execution();
            }
        });
        Self {
            cancel: Some(cancel),
            thread: Some(thread),
            fired,
        }
    }

    fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Takes the bootstrap's entry points off the global object, applies the
/// session options and freezes the intrinsics before any hook runs.
fn claim_script(options: &serde_json::Value) -> String {
    format!(
        "(() => {{ const api = globalThis.__hook_sandbox__; delete globalThis.__hook_sandbox__; api.configure({}); api.lockdown(); return api; }})()",
        options
    )
}

/// Bootstrap functions the host calls directly. Hook code has no reference
/// to them once they are claimed.
struct EntryPoints {
    execute: v8::Global<v8::Function>,
    invoke: v8::Global<v8::Function>,
}

impl EntryPoints {
    fn claim(runtime: &mut JsRuntime, options: &serde_json::Value) -> Result<Self, Error> {
        let api = runtime.execute_script("<hook-sandbox:claim>", claim_script(options))?;
        let scope = &mut runtime.handle_scope();
        let api = v8::Local::new(scope, api);
        let api = v8::Local::<v8::Object>::try_from(api)
            .map_err(|_| anyhow!("sandbox bootstrap did not install its entry points"))?;
        Ok(Self {
            execute: entry_function(scope, api, "execute")?,
            invoke: entry_function(scope, api, "invoke")?,
        })
    }
}

fn entry_function(
    scope: &mut v8::HandleScope,
    api: v8::Local<v8::Object>,
    name: &str,
) -> Result<v8::Global<v8::Function>, Error> {
    let key = v8::String::new(scope, name).ok_or_else(|| anyhow!("cannot allocate '{}'", name))?;
    let value = api
        .get(scope, key.into())
        .ok_or_else(|| anyhow!("sandbox entry point '{}' is missing", name))?;
    let function = v8::Local::<v8::Function>::try_from(value)
        .map_err(|_| anyhow!("sandbox entry point '{}' is not a function", name))?;
    Ok(v8::Global::new(scope, function))
}

/// Terminates the isolate when V8 reports it is about to run out of heap.
///
/// The returned limit gives the terminated hook room to unwind; it is put
/// back once the load has been failed.
fn install_heap_guard(runtime: &mut JsRuntime, exceeded: Arc<AtomicBool>) {
    let isolate_handle = runtime.v8_isolate().thread_safe_handle();
    runtime.add_near_heap_limit_callback(move |current, initial| {
        tracing::warn!(
            target: "hook_sandbox",
            current_mb = current / (1024 * 1024),
            initial_mb = initial / (1024 * 1024),
            "hook isolate hit its heap limit, terminating"
        );
        exceeded.store(true, Ordering::SeqCst);
        isolate_handle.terminate_execution();
        current * 2
    });
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokePayload<'a> {
    #[serde(flatten)]
    spec: &'a ContextSpec,
    generation: u32,
}

/// Parse a sandbox reply. Element trees nest deeper than serde_json's
/// default limit allows; the bootstrap caps their depth instead.
fn parse_reply<T: DeserializeOwned>(json: &str) -> Result<T, Failure> {
    let mut de = serde_json::Deserializer::from_str(json);
    de.disable_recursion_limit();
    let reply = T::deserialize(&mut de).and_then(|reply| de.end().map(|()| reply));
    reply.map_err(|e| Failure::execute(format!("malformed sandbox reply: {}", e)))
}

pub struct HookSandbox {
    runtime: JsRuntime,
    entry: EntryPoints,
    timeout: Option<Duration>,
    max_heap_size: Option<usize>,
    heap_exceeded: Arc<AtomicBool>,
}

impl HookSandbox {
    /// Create a fresh isolate wired to `resolver` and `session`.
    pub fn new(
        config: &SandboxConfig,
        resolver: Rc<ImportResolver>,
        session: Rc<RefCell<SessionState>>,
    ) -> Result<Self, Error> {
        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(BlockedModuleLoader)),
            extensions: vec![hook_runtime::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let heap_exceeded = Arc::new(AtomicBool::new(false));
        if config.max_heap_size.is_some() {
            install_heap_guard(&mut runtime, heap_exceeded.clone());
        }

        {
            let op_state = runtime.op_state();
            let mut state = op_state.borrow_mut();
            state.put(ConsoleOutput::default());
            state.put(HostEffects::default());
            state.put(ActiveLoad::default());
            state.put(resolver);
            state.put(session);
        }

        let options = serde_json::json!({ "stylingAlias": config.styling_alias });
        let entry = EntryPoints::claim(&mut runtime, &options)?;

        Ok(Self {
            runtime,
            entry,
            timeout: config.timeout_ms.map(Duration::from_millis),
            max_heap_size: config.max_heap_size,
            heap_exceeded,
        })
    }

    /// Clear captured console output and host effects before a new load.
    pub fn reset_effects(&mut self) {
        let op_state = self.runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(ConsoleOutput::default());
        state.put(HostEffects::default());
        let ActiveLoad(generation) = state.try_take::<ActiveLoad>().unwrap_or_default();
        state.put(ActiveLoad(generation.wrapping_add(1)));
    }

    /// Take what the last load printed and requested.
    pub fn take_effects(&mut self) -> (HostEffects, ConsoleOutput) {
        let op_state = self.runtime.op_state();
        let mut state = op_state.borrow_mut();
        let effects = std::mem::take(state.borrow_mut::<HostEffects>());
        let console = std::mem::take(state.borrow_mut::<ConsoleOutput>());
        (effects, console)
    }

    fn generation(&mut self) -> u32 {
        let op_state = self.runtime.op_state();
        let state = op_state.borrow();
        state.try_borrow::<ActiveLoad>().copied().unwrap_or_default().0
    }

    /// Evaluate `compiled` as the body of the sandbox function and keep its
    /// exports as the entry unit for `virtual_path`.
    pub fn execute(&mut self, compiled: &str, virtual_path: &str) -> Result<ModuleSummary, Failure> {
        let execute = self.entry.execute.clone();

        let watchdog = self.timeout.map(|t| Watchdog::arm(&mut self.runtime, t));
        let result = self.call_entry(&execute, &[virtual_path, compiled]);
        self.check_interrupts(watchdog)?;

        let value = result.map_err(|e| Failure::Execute {
            message: format!("{}: {}", virtual_path, e),
            export_keys: Vec::new(),
            snippet: Some(snippet(compiled, SNIPPET_CHARS)),
        })?;
        let json = self.value_to_string(&value)?;
        let outcome: ExecuteOutcome = parse_reply(&json)?;

        if outcome.ok {
            return Ok(ModuleSummary {
                keys: outcome.keys,
                default_callable: outcome.default_callable,
            });
        }

        let failure = match outcome.error {
            Some(error) => error.into_failure(virtual_path),
            None => Failure::execute(format!("{}: evaluation failed", virtual_path)),
        };
        Err(match failure {
            Failure::Execute {
                message,
                export_keys,
                ..
            } => Failure::Execute {
                message,
                export_keys,
                snippet: Some(snippet(compiled, SNIPPET_CHARS)),
            },
            other => other,
        })
    }

    /// Call the entry unit's default export with a fresh HookContext and
    /// wait for the element it produces.
    pub async fn invoke_default(&mut self, spec: &ContextSpec) -> Result<Element, Failure> {
        let payload = InvokePayload {
            spec,
            generation: self.generation(),
        };
        let payload = serde_json::to_string(&payload)
            .map_err(|e| Failure::execute(format!("cannot encode hook context: {}", e)))?;

        let watchdog = self.timeout.map(|t| Watchdog::arm(&mut self.runtime, t));
        let result = self.invoke_inner(&payload).await;
        let interrupted = self.check_interrupts(watchdog);
        if interrupted.is_err() || result.is_err() {
            // Whatever the hook left pending may still run; keep it away from the next load.
            self.abandon_load();
        }
        interrupted?;

        let json = result?;
        let outcome: InvokeOutcome = parse_reply(&json)?;

        if !outcome.ok {
            return Err(match outcome.error {
                Some(error) => error.into_failure(&spec.path),
                None => Failure::execute(format!("{}: entry function failed", spec.path)),
            });
        }

        serde_json::from_value(outcome.element)
            .map_err(|e| Failure::execute(format!("{}: unusable element: {}", spec.path, e)))
    }

    async fn invoke_inner(&mut self, payload: &str) -> Result<String, Failure> {
        let invoke = self.entry.invoke.clone();
        let promise = self
            .call_entry(&invoke, &[payload])
            .map_err(Failure::execute)?;

        // Run event loop to handle nested module loads
        let event_loop = self.runtime.run_event_loop(PollEventLoopOptions::default());
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, event_loop)
                .await
                .map_err(|_| Failure::execute(format!("hook timed out after {}ms", timeout.as_millis())))?,
            None => event_loop.await,
        };
        outcome.map_err(|e| Failure::execute(e.to_string()))?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &promise);
        let promise = v8::Local::<v8::Promise>::try_from(local)
            .map_err(|_| Failure::execute("sandbox did not return a promise"))?;

        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let result = promise.result(scope);
                if result.is_string() {
                    Ok(result.to_rust_string_lossy(scope))
                } else {
                    Err(Failure::execute("sandbox reply must be a string"))
                }
            }
            v8::PromiseState::Rejected => {
                let exception = promise.result(scope);
                Err(Failure::execute(format!(
                    "entry function threw: {}",
                    exception.to_rust_string_lossy(scope)
                )))
            }
            v8::PromiseState::Pending => Err(Failure::execute(
                "entry function never settled (waiting on a module that waits on it?)",
            )),
        }
    }

    /// Call a bootstrap entry point with string arguments.
    fn call_entry(
        &mut self,
        function: &v8::Global<v8::Function>,
        args: &[&str],
    ) -> Result<v8::Global<v8::Value>, String> {
        let scope = &mut self.runtime.handle_scope();
        let function = v8::Local::new(scope, function);
        let mut argv: Vec<v8::Local<v8::Value>> = Vec::with_capacity(args.len());
        for arg in args {
            let arg = v8::String::new(scope, arg).ok_or("argument too large for the isolate")?;
            argv.push(arg.into());
        }

        let scope = &mut v8::TryCatch::new(scope);
        let recv = v8::undefined(scope).into();
        match function.call(scope, recv, &argv) {
            Some(value) => Ok(v8::Global::new(scope, value)),
            None => Err(scope
                .exception()
                .map(|exception| exception.to_rust_string_lossy(scope))
                .unwrap_or_else(|| String::from("execution terminated"))),
        }
    }

    /// Stop effects from the current HookContext reaching the session.
    fn abandon_load(&mut self) {
        let op_state = self.runtime.op_state();
        let mut state = op_state.borrow_mut();
        let ActiveLoad(generation) = state.try_take::<ActiveLoad>().unwrap_or_default();
        state.put(ActiveLoad(generation.wrapping_add(1)));
    }

    /// Turn a watchdog or heap termination into a failure and make the
    /// isolate usable for the next load.
    fn check_interrupts(&mut self, watchdog: Option<Watchdog>) -> Result<(), Failure> {
        let timed_out = watchdog.map(Watchdog::disarm).unwrap_or(false);
        let heap_exceeded = self.heap_exceeded.swap(false, Ordering::SeqCst);
        if !timed_out && !heap_exceeded {
            return Ok(());
        }

        self.runtime.v8_isolate().cancel_terminate_execution();

        if heap_exceeded {
            // Reclaim what the hook left behind before restoring the cap.
            self.runtime.v8_isolate().low_memory_notification();
            if let Some(limit) = self.max_heap_size {
                self.runtime.remove_near_heap_limit_callback(limit);
                install_heap_guard(&mut self.runtime, self.heap_exceeded.clone());
                return Err(Failure::execute(format!(
                    "heap limit exceeded ({} MiB)",
                    limit / (1024 * 1024)
                )));
            }
            return Err(Failure::execute("heap limit exceeded"));
        }

        let ms = self.timeout.map(|t| t.as_millis()).unwrap_or_default();
        Err(Failure::execute(format!("hook timed out after {}ms", ms)))
    }

    fn value_to_string(&mut self, value: &v8::Global<v8::Value>) -> Result<String, Failure> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        if local.is_string() {
            Ok(local.to_rust_string_lossy(scope))
        } else {
            Err(Failure::execute("sandbox reply must be a string"))
        }
    }
}
