//! Load Orchestrator - dedup, caching and bounded retry per load key.
//!
//! Rules, per [`LoadKey`]:
//! - a request while the same key is in flight is a no-op
//! - a cached element short-circuits until the key changes or a manual retry
//! - after a failure, automatic attempts wait for the minimum interval
//! - after `max_attempts` consecutive failures automatic attempts stop
//! - a manual retry clears everything and runs immediately
//! - a render failure of a loaded element jumps straight to the cap
//!
//! Loads are not cancelled. A load whose key stopped being current while it
//! ran finishes, and its element is dropped; a failure still counts against
//! its key. Dropping a request future mid-load releases the key.

use crate::config::RetryPolicy;
use crate::diagnostics::Diagnostics;
use crate::error::{Failure, HookError, Phase};
use crate::loader::{LoadHook, LoadKey, LoadedHook};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a request or retry.
#[derive(Debug, Clone)]
pub enum LoadStatus {
    /// A fresh load completed.
    Loaded(Rc<LoadedHook>),
    /// Served from the cached element without loading.
    Cached(Rc<LoadedHook>),
    /// Another load for this key is still running.
    InFlight,
    /// The last attempt failed too recently.
    Throttled { retry_in: Duration },
    /// Automatic retries are exhausted; only a manual retry loads again.
    Paused {
        attempts: u32,
        last_error: Option<HookError>,
    },
    Failed(HookError),
    /// The key stopped being current while it loaded; the result was dropped.
    Superseded,
}

impl LoadStatus {
    pub fn hook(&self) -> Option<&Rc<LoadedHook>> {
        match self {
            LoadStatus::Loaded(hook) | LoadStatus::Cached(hook) => Some(hook),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    last_attempt: Option<Instant>,
    last_error: Option<HookError>,
}

/// Point-in-time view of one key's state.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySnapshot {
    pub attempts: u32,
    pub last_error: Option<HookError>,
    pub cached: bool,
    pub in_flight: bool,
}

/// Marks a key in flight until dropped.
struct InFlight<'a> {
    keys: &'a RefCell<HashSet<LoadKey>>,
    key: LoadKey,
}

impl<'a> InFlight<'a> {
    fn enter(keys: &'a RefCell<HashSet<LoadKey>>, key: &LoadKey) -> Self {
        keys.borrow_mut().insert(key.clone());
        Self {
            keys,
            key: key.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.borrow_mut().remove(&self.key);
    }
}

pub struct LoadOrchestrator<L> {
    loader: L,
    policy: RetryPolicy,
    diagnostics: Diagnostics,
    in_flight: RefCell<HashSet<LoadKey>>,
    current: RefCell<Option<LoadKey>>,
    last_success: RefCell<Option<(LoadKey, Rc<LoadedHook>)>>,
    states: RefCell<HashMap<LoadKey, RetryState>>,
}

impl<L: LoadHook> LoadOrchestrator<L> {
    pub fn new(loader: L, policy: RetryPolicy, diagnostics: Diagnostics) -> Self {
        Self {
            loader,
            policy,
            diagnostics,
            in_flight: RefCell::new(HashSet::new()),
            current: RefCell::new(None),
            last_success: RefCell::new(None),
            states: RefCell::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Automatic load request, subject to dedup, cache and retry policy.
    pub async fn request(&self, key: LoadKey, params: &BTreeMap<String, String>) -> LoadStatus {
        self.make_current(&key);

        if self.in_flight.borrow().contains(&key) {
            return LoadStatus::InFlight;
        }
        if let Some(hook) = self.cached(&key) {
            return LoadStatus::Cached(hook);
        }

        {
            let states = self.states.borrow();
            if let Some(state) = states.get(&key) {
                if state.attempts >= self.policy.max_attempts {
                    return LoadStatus::Paused {
                        attempts: state.attempts,
                        last_error: state.last_error.clone(),
                    };
                }
                if let (Some(_), Some(last)) = (&state.last_error, state.last_attempt) {
                    let elapsed = last.elapsed();
                    let interval = self.policy.min_interval();
                    if elapsed < interval {
                        return LoadStatus::Throttled {
                            retry_in: interval - elapsed,
                        };
                    }
                }
            }
        }

        self.run(key, params).await
    }

    /// Manual retry: clears the key's failures and cached element and loads
    /// immediately, whatever the retry policy says.
    pub async fn retry(&self, key: LoadKey, params: &BTreeMap<String, String>) -> LoadStatus {
        self.make_current(&key);

        if self.in_flight.borrow().contains(&key) {
            return LoadStatus::InFlight;
        }

        self.states.borrow_mut().remove(&key);
        self.drop_cached(&key);
        tracing::info!(target: "hook_sandbox", key = %key, "manual retry");

        self.run(key, params).await
    }

    /// The loaded element for `key` failed while rendering. Pauses automatic
    /// retries for the key at once.
    pub fn report_render_failure(&self, key: &LoadKey, message: impl Into<String>) {
        let error = HookError::new(
            key.host.clone(),
            key.path.clone(),
            Failure::Render {
                message: message.into(),
            },
        );
        self.diagnostics
            .failed(Phase::Render, &key.path, error.failure.to_string());

        self.drop_cached(key);
        let mut states = self.states.borrow_mut();
        let state = states.entry(key.clone()).or_default();
        state.attempts = self.policy.max_attempts;
        state.last_error = Some(error);
    }

    pub fn snapshot(&self, key: &LoadKey) -> RetrySnapshot {
        let states = self.states.borrow();
        let state = states.get(key);
        RetrySnapshot {
            attempts: state.map(|s| s.attempts).unwrap_or(0),
            last_error: state.and_then(|s| s.last_error.clone()),
            cached: self.cached(key).is_some(),
            in_flight: self.in_flight.borrow().contains(key),
        }
    }

    async fn run(&self, key: LoadKey, params: &BTreeMap<String, String>) -> LoadStatus {
        let in_flight = InFlight::enter(&self.in_flight, &key);
        self.states
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .last_attempt = Some(Instant::now());

        let result = self.loader.load(&key, params).await;
        drop(in_flight);

        let superseded = self.current.borrow().as_ref() != Some(&key);
        let mut states = self.states.borrow_mut();
        let state = states.entry(key.clone()).or_default();
        match result {
            Ok(_) if superseded => {
                tracing::debug!(target: "hook_sandbox", key = %key, "discarding superseded load");
                LoadStatus::Superseded
            }
            Ok(loaded) => {
                state.attempts = 0;
                state.last_error = None;
                let hook = Rc::new(loaded);
                *self.last_success.borrow_mut() = Some((key, hook.clone()));
                LoadStatus::Loaded(hook)
            }
            Err(error) => {
                state.attempts = (state.attempts + 1).min(self.policy.max_attempts);
                state.last_error = Some(error.clone());
                tracing::warn!(
                    target: "hook_sandbox",
                    key = %key,
                    attempts = state.attempts,
                    phase = %error.phase(),
                    superseded,
                    "hook load failed"
                );
                if superseded {
                    return LoadStatus::Superseded;
                }
                LoadStatus::Failed(error)
            }
        }
    }

    fn make_current(&self, key: &LoadKey) {
        let mut current = self.current.borrow_mut();
        if current.as_ref() != Some(key) {
            *current = Some(key.clone());
        }
    }

    fn cached(&self, key: &LoadKey) -> Option<Rc<LoadedHook>> {
        match &*self.last_success.borrow() {
            Some((cached_key, hook)) if cached_key == key => Some(hook.clone()),
            _ => None,
        }
    }

    fn drop_cached(&self, key: &LoadKey) {
        let mut last_success = self.last_success.borrow_mut();
        if last_success.as_ref().is_some_and(|(cached_key, _)| cached_key == key) {
            *last_success = None;
        }
    }
}
