//! Per-scope tracking state, kept in the host's invocation-scoped temp state.

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceId};
use opentelemetry::{Context, KeyValue};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::warn;
use veadk_core::{TempState, UsageMetadata};

use super::stream::StreamAccumulator;
use crate::scope::ScopePhase;

const PREFIX: &str = "veadk.observability";

pub(crate) fn invocation_key() -> String {
    format!("{PREFIX}.invocation")
}

pub(crate) fn agent_key(agent_name: &str) -> String {
    format!("{PREFIX}.agent.{agent_name}")
}

pub(crate) fn llm_key(agent_name: &str) -> String {
    format!("{PREFIX}.llm.{agent_name}")
}

/// Points at the key of the most recently opened model call scope.
pub(crate) fn current_llm_key() -> String {
    format!("{PREFIX}.llm.current")
}

/// Key of the model call scope most recently opened in this invocation.
pub(crate) fn current_llm(state: &TempState) -> Option<Arc<String>> {
    state.get::<String>(&current_llm_key())
}

pub(crate) fn clear_current_llm(state: &TempState, llm_key: &str) {
    if current_llm(state).is_some_and(|current| current.as_str() == llm_key) {
        state.remove(&current_llm_key());
    }
}

pub(crate) fn tool_key(call_id: &str, tool_name: &str) -> String {
    if call_id.is_empty() {
        format!("{PREFIX}.tool.{tool_name}")
    } else {
        format!("{PREFIX}.tool.{call_id}")
    }
}

/// Timing and token bookkeeping of one scope.
#[derive(Debug, Clone)]
pub(crate) struct SpanMetadata {
    pub start_time: Instant,
    pub first_token_time: Option<Instant>,
    /// Running totals: the invocation's totals before this call plus this call's usage.
    pub prompt_tokens: i64,
    pub candidates_tokens: i64,
    pub total_tokens: i64,
    /// The invocation's totals when this call started.
    pub prev_prompt_tokens: i64,
    pub prev_candidates_tokens: i64,
    pub prev_total_tokens: i64,
    pub model_name: String,
}

impl SpanMetadata {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            start_time: Instant::now(),
            first_token_time: None,
            prompt_tokens: 0,
            candidates_tokens: 0,
            total_tokens: 0,
            prev_prompt_tokens: 0,
            prev_candidates_tokens: 0,
            prev_total_tokens: 0,
            model_name: model_name.into(),
        }
    }

    /// Starts counting on top of totals already accumulated by earlier calls.
    pub fn continuing_from(mut self, prompt: i64, candidates: i64, total: i64) -> Self {
        self.prev_prompt_tokens = prompt;
        self.prev_candidates_tokens = candidates;
        self.prev_total_tokens = total;
        self.prompt_tokens = prompt;
        self.candidates_tokens = candidates;
        self.total_tokens = total;
        self
    }

    pub fn apply_usage(&mut self, usage: &UsageMetadata) {
        self.prompt_tokens = self.prev_prompt_tokens + i64::from(usage.prompt_token_count);
        self.candidates_tokens =
            self.prev_candidates_tokens + i64::from(usage.candidates_token_count);
        self.total_tokens = self.prev_total_tokens + i64::from(usage.total_token_count);
    }

    pub fn elapsed_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.start_time).as_secs_f64()
    }
}

pub(crate) struct TrackedScope {
    pub phase: ScopePhase,
    pub cx: Context,
    pub metadata: SpanMetadata,
    /// Key under which the trace's registry entries are purged.
    pub trace_key: TraceId,
    pub host_span_id: SpanId,
    pub metric_attributes: Vec<KeyValue>,
    pub accumulator: StreamAccumulator,
    /// Usage as reported for this call alone, latest chunk wins.
    pub call_usage: Option<UsageMetadata>,
    /// Final text of the last completed model call (invocation scope).
    pub last_output: Option<String>,
}

impl TrackedScope {
    pub fn open(
        scope: &'static str,
        cx: Context,
        metadata: SpanMetadata,
        trace_key: TraceId,
        host_span_id: SpanId,
    ) -> Self {
        let phase = ScopePhase::NotStarted
            .transition(scope, ScopePhase::Open)
            .unwrap_or(ScopePhase::Open);
        Self {
            phase,
            cx,
            metadata,
            trace_key,
            host_span_id,
            metric_attributes: Vec::new(),
            accumulator: StreamAccumulator::new(),
            call_usage: None,
            last_output: None,
        }
    }

    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    /// Moves the scope to `Closed`, ending its span. Logs and returns false
    /// when the scope was not open.
    pub fn close(&mut self, scope: &'static str) -> bool {
        match self.phase.transition(scope, ScopePhase::Closed) {
            Ok(phase) => {
                self.phase = phase;
                self.cx.span().end();
                true
            }
            Err(e) => {
                warn!(error = %e, "Ignoring close of scope that is not open");
                false
            }
        }
    }
}

pub(crate) type SharedScope = Arc<Mutex<TrackedScope>>;

pub(crate) fn lock(scope: &SharedScope) -> MutexGuard<'_, TrackedScope> {
    scope.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn store(state: &TempState, key: impl Into<String>, scope: TrackedScope) {
    state.insert(key, Mutex::new(scope));
}

pub(crate) fn load(state: &TempState, key: &str) -> Option<SharedScope> {
    state.get::<Mutex<TrackedScope>>(key)
}

/// The context of the scope under `key` if it is currently open.
pub(crate) fn open_context(state: &TempState, key: &str) -> Option<Context> {
    let scope = load(state, key)?;
    let scope = lock(&scope);
    scope.phase.is_open().then(|| scope.cx.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates_on_previous_totals() {
        let mut metadata = SpanMetadata::new("m").continuing_from(10, 5, 15);
        metadata.apply_usage(&UsageMetadata {
            prompt_token_count: 8,
            candidates_token_count: 3,
            total_token_count: 11,
            thoughts_token_count: None,
        });
        assert_eq!(
            (metadata.prompt_tokens, metadata.candidates_tokens, metadata.total_tokens),
            (18, 8, 26)
        );
    }

    #[test]
    fn test_open_context_requires_open_phase() {
        let state = TempState::new();
        let key = agent_key("planner");
        let scope = TrackedScope::open(
            "agent",
            Context::new(),
            SpanMetadata::new(""),
            TraceId::INVALID,
            SpanId::INVALID,
        );
        store(&state, key.clone(), scope);
        assert!(open_context(&state, &key).is_some());

        let scope = load(&state, &key).unwrap();
        assert!(lock(&scope).close("agent"));
        assert!(!lock(&scope).close("agent"));
        assert!(open_context(&state, &key).is_none());
    }

    #[test]
    fn test_tool_key_falls_back_to_name() {
        assert_eq!(tool_key("", "search"), "veadk.observability.tool.search");
        assert_eq!(tool_key("call_1", "search"), "veadk.observability.tool.call_1");
    }
}
