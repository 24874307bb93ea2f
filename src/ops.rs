//! Ops backing the HookContext helpers and the import router.
//!
//! These are the only ways code inside the isolate can reach the host. Each
//! one reads its collaborators out of `OpState`, which the sandbox fills at
//! creation time.

use crate::context::{HostEffects, SessionState};
use crate::resolver::{ImportResolver, ModuleUnit, Resolution};
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the sandboxed runtime
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    tracing::debug!(target: "hook_console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "hook_console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    tracing::error!(target: "hook_console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Import Routing
// ============================================================================

#[op2]
#[serde]
pub fn op_hook_resolve(
    state: &mut OpState,
    #[string] reference: String,
    #[string] from_path: String,
) -> Resolution {
    state
        .borrow::<Rc<ImportResolver>>()
        .cache_key(&reference, &from_path)
}

#[op2(async)]
#[serde]
pub async fn op_hook_load_module(
    state: Rc<RefCell<OpState>>,
    #[string] reference: String,
    #[string] from_path: String,
    #[string] key: String,
) -> Result<ModuleUnit, AnyError> {
    let resolver = state.borrow().borrow::<Rc<ImportResolver>>().clone();
    Ok(resolver.load_unit(&reference, &from_path, &key).await)
}

// ============================================================================
// Helpers
// ============================================================================

/// Generation of the load whose HookContext may record effects.
///
/// Bumped whenever a load starts or is abandoned, so a hook still running
/// after its load timed out cannot touch the next one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveLoad(pub u32);

fn is_current(state: &OpState, generation: u32, effect: &str) -> bool {
    let current = state.try_borrow::<ActiveLoad>().copied().unwrap_or_default();
    if current.0 != generation {
        tracing::debug!(
            target: "hook_sandbox",
            effect,
            generation,
            current = current.0,
            "dropping effect from a finished load"
        );
        return false;
    }
    true
}

#[op2(fast)]
pub fn op_hook_navigate(state: &mut OpState, generation: u32, #[string] to: &str) {
    if !is_current(state, generation, "navigate") {
        return;
    }
    tracing::info!(target: "hook_sandbox", to, "hook requested navigation");
    if let Some(effects) = state.try_borrow_mut::<HostEffects>() {
        effects.navigations.push(to.to_string());
    }
}

#[op2(fast)]
pub fn op_hook_set_branch(state: &mut OpState, generation: u32, #[string] name: &str) {
    if !is_current(state, generation, "setBranch") {
        return;
    }
    tracing::info!(target: "hook_sandbox", branch = name, "hook switched branch");
    state
        .borrow::<Rc<RefCell<SessionState>>>()
        .borrow_mut()
        .branch = Some(name.to_string());
    if let Some(effects) = state.try_borrow_mut::<HostEffects>() {
        effects.branch_changes.push(name.to_string());
    }
}

#[op2]
#[string]
pub fn op_hook_peer_url(state: &mut OpState, #[string] path: &str) -> String {
    state
        .borrow::<Rc<RefCell<SessionState>>>()
        .borrow()
        .peer_url(path)
}

#[op2]
#[serde]
pub fn op_hook_repo_headers(state: &mut OpState) -> BTreeMap<String, String> {
    state
        .borrow::<Rc<RefCell<SessionState>>>()
        .borrow()
        .repo_headers()
}

#[op2]
pub fn op_hook_register_theme(state: &mut OpState, generation: u32, #[serde] styles: serde_json::Value) {
    if !is_current(state, generation, "registerThemeStyles") {
        return;
    }
    if let Some(effects) = state.try_borrow_mut::<HostEffects>() {
        effects.theme_styles.push(styles);
    }
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    hook_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_hook_resolve,
        op_hook_load_module,
        op_hook_navigate,
        op_hook_set_branch,
        op_hook_peer_url,
        op_hook_repo_headers,
        op_hook_register_theme,
    ],
    esm_entry_point = "ext:hook_runtime/bootstrap.js",
    esm = ["ext:hook_runtime/bootstrap.js" = "src/bootstrap.js"],
);
