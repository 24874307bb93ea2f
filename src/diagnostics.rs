//! Per-session record of phase boundaries.
//!
//! Every fetch, compile, resolve, execute and render boundary reports here,
//! successful or not. Events are mirrored to `tracing` and the most recent
//! ones are kept so a consumer can show the raw trail behind a failure.

use crate::error::Phase;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const MAX_EVENTS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    pub phase: Phase,
    pub path: String,
    pub ok: bool,
    pub message: String,
}

/// Shared, bounded event log. Cloning shares the same log.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    events: Rc<RefCell<VecDeque<DiagnosticEvent>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&self, phase: Phase, path: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "hook_sandbox", %phase, path, "{}", message);
        self.push(DiagnosticEvent {
            phase,
            path: path.to_string(),
            ok: true,
            message,
        });
    }

    pub fn failed(&self, phase: Phase, path: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "hook_sandbox", %phase, path, "{}", message);
        self.push(DiagnosticEvent {
            phase,
            path: path.to_string(),
            ok: false,
            message,
        });
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.borrow().iter().cloned().collect()
    }

    pub fn failures(&self) -> Vec<DiagnosticEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|e| !e.ok)
            .cloned()
            .collect()
    }

    fn push(&self, event: DiagnosticEvent) {
        let mut events = self.events.borrow_mut();
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }
}
