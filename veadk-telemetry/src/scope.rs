//! Explicit per-scope lifecycle.
//!
//! Every scope the plugin tracks (invocation, agent, model call, tool call)
//! moves `NotStarted -> Open -> Closed` exactly once. Callbacks arrive from the
//! host without any tree structure, so a callback that finds its scope in the
//! wrong phase is reported instead of acted upon.

use crate::error::{Result, TelemetryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopePhase {
    #[default]
    NotStarted,
    Open,
    Closed,
}

impl ScopePhase {
    pub fn is_open(self) -> bool {
        self == ScopePhase::Open
    }

    /// Validates and returns the next phase.
    pub fn transition(self, scope: &'static str, to: ScopePhase) -> Result<ScopePhase> {
        match (self, to) {
            (ScopePhase::NotStarted, ScopePhase::Open)
            | (ScopePhase::Open, ScopePhase::Closed) => Ok(to),
            (from, to) => Err(TelemetryError::InvalidTransition { scope, from, to }),
        }
    }
}
