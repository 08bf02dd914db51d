//! The observability plugin.
//!
//! Host callbacks arrive as a flat sequence with no tree structure. The plugin
//! rebuilds the hierarchy invocation -> agent -> model call -> tool call by
//! keeping one tracked scope per open span in the host's temp state and
//! looking up the enclosing scope whenever a new one starts.
//!
//! Nothing here ever fails the host: missing scopes and out-of-order callbacks
//! are logged and skipped, and every hook returns "no override".

mod state;
mod stream;

pub use stream::StreamAccumulator;

use async_trait::async_trait;
use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceContextExt, TraceId, Tracer as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::Tracer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use veadk_core::{
    CallbackContext, Content, InvocationContext, LlmRequest, LlmResponse, Part, ReadonlyContext,
    Result, TempState, ToolContext,
};
use veadk_plugin::Plugin;

use crate::attributes::{
    self, ERROR_TYPE, GEN_AI_AGENT_NAME, GEN_AI_CHOICE_EVENT, GEN_AI_INPUT, GEN_AI_OPERATION_NAME,
    GEN_AI_OUTPUT, GEN_AI_REQUEST_MODEL, GEN_AI_SPAN_KIND, GEN_AI_SYSTEM, GEN_AI_TOOL_CALL_ID,
    GEN_AI_TOOL_ESTIMATED_INPUT_TOKENS, GEN_AI_TOOL_ESTIMATED_OUTPUT_TOKENS, GEN_AI_TOOL_INPUT,
    GEN_AI_TOOL_NAME, GEN_AI_TOOL_OUTPUT, GEN_AI_USAGE_REASONING_TOKENS, THOUGHT_EVENT, aliased,
    aliased_str, operation, span_kind,
};
use crate::metrics::MetricsRegistry;
use crate::registry::SpanRegistry;
use crate::resolver::{ContextField, ContextResolver};
use state::{SharedScope, SpanMetadata, TrackedScope};

const INVOCATION: &str = "invocation";
const AGENT: &str = "agent";
const LLM: &str = "llm";
const TOOL: &str = "tool";

/// Rough token estimate for a tool payload: serialized JSON bytes / 4.
///
/// An approximation only, not a tokenizer count.
pub fn estimate_tokens(payload: &Value) -> u64 {
    serde_json::to_vec(payload).map(|bytes| bytes.len() as u64 / 4).unwrap_or(0)
}

pub struct ObservabilityPlugin {
    tracer: Tracer,
    registry: Arc<SpanRegistry>,
    metrics: Arc<MetricsRegistry>,
    resolver: Arc<ContextResolver>,
}

impl ObservabilityPlugin {
    pub fn new(
        tracer: Tracer,
        registry: Arc<SpanRegistry>,
        metrics: Arc<MetricsRegistry>,
        resolver: Arc<ContextResolver>,
    ) -> Self {
        Self { tracer, registry, metrics, resolver }
    }

    pub fn registry(&self) -> &Arc<SpanRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn start_span(
        &self,
        name: String,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: &Context,
    ) -> Context {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, parent);
        parent.with_span(span)
    }

    fn base_attributes<C: ReadonlyContext + ?Sized>(
        &self,
        ctx: &C,
        kind: &'static str,
        op: &'static str,
    ) -> Vec<KeyValue> {
        let mut attributes = attributes::common_attributes(&self.resolver, ctx);
        let agent_name = self.resolver.resolve(ContextField::AgentName, Some(ctx));
        attributes.extend(aliased_str(GEN_AI_AGENT_NAME, agent_name));
        attributes.extend(attributes::kind_attributes(kind, op));
        attributes
    }

    fn provider(&self) -> String {
        self.resolver.resolve_global(ContextField::ModelProvider)
    }

    /// Parent of last resort: the host's own span for this scope, else the ambient context.
    fn ambient_parent<C: ReadonlyContext + ?Sized>(ctx: &C) -> Context {
        match ctx.host_span().filter(SpanContext::is_valid) {
            Some(host) => Context::new().with_remote_span_context(host),
            None => Context::current(),
        }
    }

    /// Trace key and scope of the running invocation, if one is tracked.
    fn invocation_trace(state: &TempState) -> Option<(TraceId, SharedScope)> {
        let scope = state::load(state, &state::invocation_key())?;
        let trace_key = state::lock(&scope).trace_key;
        Some((trace_key, scope))
    }

    fn record_span_end(&self, seconds: f64, attributes: &[KeyValue]) {
        self.metrics.record_operation_duration(seconds, attributes);
        self.metrics.record_span_latency(seconds, attributes);
    }

    fn fail_scope(&self, scope: &mut TrackedScope, name: &'static str, error: &str) {
        if !scope.phase.is_open() {
            warn!(scope = name, "Error reported for a scope that is not open");
            return;
        }
        let span = scope.cx.span();
        span.set_status(Status::error(error.to_string()));
        span.set_attribute(KeyValue::new(ERROR_TYPE, error.to_string()));

        let mut metric_attributes = scope.metric_attributes.clone();
        metric_attributes.push(KeyValue::new(ERROR_TYPE, "error"));
        self.metrics.record_exception(&metric_attributes);
        self.record_span_end(scope.metadata.elapsed_secs(Instant::now()), &metric_attributes);
        scope.close(name);
    }

    fn complete_model_call(
        &self,
        ctx: &dyn CallbackContext,
        scope: &mut TrackedScope,
        response: &LlmResponse,
    ) {
        let now = Instant::now();
        let content = scope.accumulator.content();
        let cx = scope.cx.clone();

        let mut attrs = attributes::response_attributes(response, &content);
        if let Some(usage) = &scope.call_usage {
            attrs.extend(attributes::usage_attributes(
                i64::from(usage.prompt_token_count),
                i64::from(usage.candidates_token_count),
                i64::from(usage.total_token_count),
            ));
            if let Some(reasoning) = usage.thoughts_token_count {
                attrs.push(KeyValue::new(GEN_AI_USAGE_REASONING_TOKENS, i64::from(reasoning)));
            }
        }
        attributes::set_span_attributes(&cx, attrs);

        let message = serde_json::to_string(&content).unwrap_or_default();
        let mut choice = vec![KeyValue::new("index", 0_i64), KeyValue::new("message", message)];
        if let Some(reason) = &response.finish_reason {
            choice.push(KeyValue::new("finish_reason", reason.as_str()));
        }
        cx.span().add_event(GEN_AI_CHOICE_EVENT, choice);

        let metric_attributes = scope.metric_attributes.clone();
        if let Some(usage) = &scope.call_usage {
            self.metrics.record_chat_count(&metric_attributes);
            self.metrics.record_token_usage(
                u64::try_from(usage.prompt_token_count).unwrap_or(0),
                u64::try_from(usage.candidates_token_count).unwrap_or(0),
                &metric_attributes,
            );
        }

        let generate_from = scope.metadata.first_token_time.unwrap_or(scope.metadata.start_time);
        let generate_secs = now.saturating_duration_since(generate_from).as_secs_f64();
        self.metrics.record_time_to_generate(generate_secs, &metric_attributes);
        let output_tokens = scope.call_usage.map(|u| u.candidates_token_count).unwrap_or(0);
        if output_tokens > 0 {
            let per_token = generate_secs / f64::from(output_tokens);
            self.metrics.record_time_per_output_token(per_token, &metric_attributes);
        }
        self.record_span_end(scope.metadata.elapsed_secs(now), &metric_attributes);

        if let Some(invocation) = state::load(ctx.temp_state(), &state::invocation_key()) {
            let mut invocation = state::lock(&invocation);
            invocation.metadata.prompt_tokens = scope.metadata.prompt_tokens;
            invocation.metadata.candidates_tokens = scope.metadata.candidates_tokens;
            invocation.metadata.total_tokens = scope.metadata.total_tokens;
            let text = content.text();
            if !text.is_empty() {
                invocation.last_output = Some(text);
            }
        }

        scope.close(LLM);
    }
}

#[async_trait]
impl Plugin for ObservabilityPlugin {
    fn name(&self) -> &str {
        "veadk_observability"
    }

    async fn before_run(&self, ctx: Arc<dyn InvocationContext>) -> Result<Option<Content>> {
        let state = ctx.temp_state();
        let key = state::invocation_key();
        if state::open_context(state, &key).is_some() {
            warn!(
                invocation_id = ctx.invocation_id(),
                "Invocation scope already open, ignoring before_run"
            );
            return Ok(None);
        }

        let mut attributes = self.base_attributes(&*ctx, span_kind::WORKFLOW, operation::CHAIN);
        attributes.extend(aliased(GEN_AI_INPUT, ctx.user_content().text()));

        // The invocation span roots a fresh trace.
        let cx =
            self.start_span(INVOCATION.to_string(), SpanKind::Server, attributes, &Context::new());
        let own = cx.span().span_context().clone();

        let host = ctx.host_span().filter(SpanContext::is_valid);
        let (trace_key, host_span_id) = match &host {
            Some(host) => {
                self.registry.register_run_mapping(host.span_id(), host.trace_id(), &cx);
                (host.trace_id(), host.span_id())
            }
            None => {
                self.registry.track_invocation_span(own.trace_id(), &cx);
                (own.trace_id(), SpanId::INVALID)
            }
        };

        let mut scope =
            TrackedScope::open(INVOCATION, cx, SpanMetadata::new(""), trace_key, host_span_id);
        scope.metric_attributes = vec![
            KeyValue::new(GEN_AI_SYSTEM, self.provider()),
            KeyValue::new(GEN_AI_OPERATION_NAME, operation::CHAIN),
            KeyValue::new(GEN_AI_SPAN_KIND, span_kind::WORKFLOW),
        ];
        state::store(state, key, scope);
        debug!(
            invocation_id = ctx.invocation_id(),
            trace_id = %own.trace_id(),
            "Invocation span opened"
        );
        Ok(None)
    }

    async fn after_run(&self, ctx: Arc<dyn InvocationContext>) {
        let state = ctx.temp_state();
        let key = state::invocation_key();
        let Some(scope) = state::load(state, &key) else {
            warn!(invocation_id = ctx.invocation_id(), "No invocation scope at after_run");
            return;
        };

        {
            let mut scope = state::lock(&scope);
            if !scope.phase.is_open() {
                warn!(
                    invocation_id = ctx.invocation_id(),
                    phase = ?scope.phase,
                    "Invocation scope not open at after_run"
                );
                return;
            }
            let m = &scope.metadata;
            let mut attrs =
                attributes::usage_attributes(m.prompt_tokens, m.candidates_tokens, m.total_tokens);
            attrs.extend(aliased(GEN_AI_OUTPUT, scope.last_output.clone().unwrap_or_default()));
            attributes::set_span_attributes(&scope.cx, attrs);

            let seconds = scope.metadata.elapsed_secs(Instant::now());
            self.record_span_end(seconds, &scope.metric_attributes);

            let own_span_id = scope.span_context().span_id();
            scope.close(INVOCATION);
            self.registry.schedule_cleanup(scope.trace_key, scope.host_span_id, own_span_id);
        }
        state.remove(&key);
        debug!(invocation_id = ctx.invocation_id(), "Invocation span closed");
    }

    async fn before_agent(&self, ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        let state = ctx.temp_state();
        let key = state::agent_key(ctx.agent_name());
        if state::open_context(state, &key).is_some() {
            warn!(agent = ctx.agent_name(), "Agent scope already open, ignoring before_agent");
            return Ok(None);
        }

        let parent = state::current_llm(state)
            .and_then(|llm_key| state::open_context(state, &llm_key))
            .or_else(|| state::open_context(state, &state::invocation_key()))
            .unwrap_or_else(|| Self::ambient_parent(&*ctx));

        let attributes = self.base_attributes(&*ctx, span_kind::AGENT, operation::INVOKE_AGENT);
        let name = format!("{} {}", operation::INVOKE_AGENT, ctx.agent_name());
        let cx = self.start_span(name, SpanKind::Internal, attributes, &parent);
        let own = cx.span().span_context().clone();

        let trace_key = Self::invocation_trace(state).map(|(key, _)| key).unwrap_or(own.trace_id());
        let host = ctx.host_span().filter(SpanContext::is_valid);
        if let Some(host) = &host {
            self.registry.register_agent_mapping(host.span_id(), host.trace_id(), &own);
        }

        let host_span_id = host.map(|h| h.span_id()).unwrap_or(SpanId::INVALID);
        let scope = TrackedScope::open(AGENT, cx, SpanMetadata::new(""), trace_key, host_span_id);
        state::store(state, key, scope);
        Ok(None)
    }

    async fn after_agent(&self, ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        let state = ctx.temp_state();
        let key = state::agent_key(ctx.agent_name());
        match state::load(state, &key) {
            Some(scope) => {
                state::lock(&scope).close(AGENT);
                state.remove(&key);
            }
            None => warn!(agent = ctx.agent_name(), "No agent scope at after_agent"),
        }
        Ok(None)
    }

    async fn before_model(
        &self,
        ctx: Arc<dyn CallbackContext>,
        request: &LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        let state = ctx.temp_state();
        let key = state::llm_key(ctx.agent_name());
        if let Some(stale) = state::load(state, &key) {
            let mut stale = state::lock(&stale);
            if stale.phase.is_open() {
                warn!(
                    agent = ctx.agent_name(),
                    "Previous model call never completed, closing its span"
                );
                stale.close(LLM);
            }
        }

        let parent = state::open_context(state, &state::agent_key(ctx.agent_name()))
            .or_else(|| state::open_context(state, &state::invocation_key()))
            .unwrap_or_else(|| Self::ambient_parent(&*ctx));

        let mut attrs = self.base_attributes(&*ctx, span_kind::LLM, operation::CHAT);
        attrs.extend(attributes::request_attributes(request));
        let name = format!("{} {}", operation::CHAT, request.model);
        let cx = self.start_span(name, SpanKind::Client, attrs, &parent);
        let own = cx.span().span_context().clone();

        let mut metadata = SpanMetadata::new(request.model.clone());
        let mut trace_key = own.trace_id();
        if let Some((invocation_trace_key, invocation)) = Self::invocation_trace(state) {
            trace_key = invocation_trace_key;
            let totals = state::lock(&invocation).metadata.clone();
            metadata = metadata.continuing_from(
                totals.prompt_tokens,
                totals.candidates_tokens,
                totals.total_tokens,
            );
        }

        let host = ctx.host_span().filter(SpanContext::is_valid);
        if let Some(host) = &host {
            self.registry.register_llm_mapping(host.span_id(), host.trace_id(), &own);
        }

        let host_span_id = host.map(|h| h.span_id()).unwrap_or(SpanId::INVALID);
        let mut scope = TrackedScope::open(LLM, cx, metadata, trace_key, host_span_id);
        scope.metric_attributes = vec![
            KeyValue::new(GEN_AI_SYSTEM, self.provider()),
            KeyValue::new(GEN_AI_REQUEST_MODEL, request.model.clone()),
            KeyValue::new(GEN_AI_OPERATION_NAME, operation::CHAT),
            KeyValue::new(GEN_AI_SPAN_KIND, span_kind::LLM),
        ];
        state::store(state, key.clone(), scope);
        state.insert(state::current_llm_key(), key);
        Ok(None)
    }

    async fn after_model(
        &self,
        ctx: Arc<dyn CallbackContext>,
        response: &LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        let state = ctx.temp_state();
        let key = state::llm_key(ctx.agent_name());
        let Some(shared) = state::load(state, &key) else {
            warn!(agent = ctx.agent_name(), "No model call scope at after_model");
            return Ok(None);
        };

        let mut scope = state::lock(&shared);
        if !scope.phase.is_open() {
            warn!(
                agent = ctx.agent_name(),
                phase = ?scope.phase,
                "Model call scope not open at after_model"
            );
            return Ok(None);
        }

        if response.is_error() {
            let message = response
                .error_message
                .clone()
                .or_else(|| response.error_code.clone())
                .unwrap_or_else(|| "model error".to_string());
            self.fail_scope(&mut scope, LLM, &message);
        } else {
            let now = Instant::now();
            let has_content = response.content.as_ref().is_some_and(|c| !c.is_empty());
            if has_content && scope.metadata.first_token_time.is_none() {
                scope.metadata.first_token_time = Some(now);
                let latency = scope.metadata.elapsed_secs(now);
                self.metrics.record_first_token_latency(latency, &scope.metric_attributes);
            }

            let thoughts = scope.accumulator.add_chunk(response.content.as_ref(), response.partial);
            for thought in thoughts {
                let content = KeyValue::new("gen_ai.thought.content", thought);
                scope.cx.span().add_event(THOUGHT_EVENT, vec![content]);
            }

            if let Some(usage) = &response.usage_metadata {
                scope.metadata.apply_usage(usage);
                scope.call_usage = Some(*usage);
            }

            if let Some(content) = &response.content {
                let parent = scope.span_context();
                for part in content.function_calls() {
                    if let Part::FunctionCall { id: Some(id), .. } = part {
                        self.registry.register_tool_call_mapping(id, scope.trace_key, &parent);
                    }
                }
            }

            if response.partial {
                return Ok(None);
            }
            self.complete_model_call(&*ctx, &mut scope, response);
        }
        drop(scope);

        state.remove(&key);
        state::clear_current_llm(state, &key);
        Ok(None)
    }

    async fn on_model_error(
        &self,
        ctx: Arc<dyn CallbackContext>,
        _request: &LlmRequest,
        error: &str,
    ) -> Result<Option<LlmResponse>> {
        let state = ctx.temp_state();
        let key = state::llm_key(ctx.agent_name());
        match state::load(state, &key) {
            Some(scope) => {
                self.fail_scope(&mut state::lock(&scope), LLM, error);
                state.remove(&key);
                state::clear_current_llm(state, &key);
            }
            None => warn!(agent = ctx.agent_name(), error, "No model call scope at on_model_error"),
        }
        Ok(None)
    }

    async fn before_tool(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        args: &Value,
    ) -> Result<Option<Value>> {
        let state = ctx.temp_state();
        let call_id = ctx.function_call_id();
        let key = state::tool_key(call_id, tool_name);

        let parent = (!call_id.is_empty())
            .then(|| self.registry.get_own_parent_by_tool_call_id(call_id))
            .flatten()
            .map(|parent| Context::new().with_remote_span_context(parent))
            .or_else(|| state::open_context(state, &state::agent_key(ctx.agent_name())))
            .or_else(|| state::open_context(state, &state::invocation_key()))
            .unwrap_or_else(|| Self::ambient_parent(&*ctx));

        let mut attrs = self.base_attributes(&*ctx, span_kind::TOOL, operation::EXECUTE_TOOL);
        attrs.push(KeyValue::new(GEN_AI_TOOL_NAME, tool_name.to_string()));
        if !call_id.is_empty() {
            attrs.push(KeyValue::new(GEN_AI_TOOL_CALL_ID, call_id.to_string()));
        }
        attrs.extend(aliased(GEN_AI_TOOL_INPUT, args.to_string()));

        let name = format!("{} {}", operation::EXECUTE_TOOL, tool_name);
        let cx = self.start_span(name, SpanKind::Internal, attrs, &parent);
        let own = cx.span().span_context().clone();

        let trace_key = Self::invocation_trace(state).map(|(key, _)| key).unwrap_or(own.trace_id());
        let host = ctx.host_span().filter(SpanContext::is_valid);
        if let Some(host) = &host {
            // The host's tool span is superseded; its children hang off the own tool span.
            self.registry.register_tool_mapping(host.span_id(), &own);
        }

        let host_span_id = host.map(|h| h.span_id()).unwrap_or(SpanId::INVALID);
        let mut scope =
            TrackedScope::open(TOOL, cx, SpanMetadata::new(""), trace_key, host_span_id);
        scope.metric_attributes = vec![
            KeyValue::new(GEN_AI_SYSTEM, self.provider()),
            KeyValue::new(GEN_AI_TOOL_NAME, tool_name.to_string()),
            KeyValue::new(GEN_AI_OPERATION_NAME, operation::EXECUTE_TOOL),
            KeyValue::new(GEN_AI_SPAN_KIND, span_kind::TOOL),
        ];
        state::store(state, key, scope);
        Ok(None)
    }

    async fn after_tool(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        args: &Value,
        result: &Value,
    ) -> Result<Option<Value>> {
        let state = ctx.temp_state();
        let key = state::tool_key(ctx.function_call_id(), tool_name);
        let Some(shared) = state::load(state, &key) else {
            warn!(tool = tool_name, "No tool scope at after_tool");
            return Ok(None);
        };

        {
            let mut scope = state::lock(&shared);
            if !scope.phase.is_open() {
                warn!(tool = tool_name, phase = ?scope.phase, "Tool scope not open at after_tool");
                return Ok(None);
            }

            let input_tokens = estimate_tokens(args);
            let output_tokens = estimate_tokens(result);
            let mut attrs = aliased(GEN_AI_TOOL_OUTPUT, result.to_string());
            attrs.push(KeyValue::new(GEN_AI_TOOL_ESTIMATED_INPUT_TOKENS, input_tokens as i64));
            attrs.push(KeyValue::new(GEN_AI_TOOL_ESTIMATED_OUTPUT_TOKENS, output_tokens as i64));
            attributes::set_span_attributes(&scope.cx, attrs);

            let metric_attributes = &scope.metric_attributes;
            self.metrics.record_tool_token_usage(input_tokens, output_tokens, metric_attributes);
            let seconds = scope.metadata.elapsed_secs(Instant::now());
            self.record_span_end(seconds, &scope.metric_attributes);
            scope.close(TOOL);
        }
        state.remove(&key);
        Ok(None)
    }

    async fn on_tool_error(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        _args: &Value,
        error: &str,
    ) -> Result<Option<Value>> {
        let state = ctx.temp_state();
        let key = state::tool_key(ctx.function_call_id(), tool_name);
        match state::load(state, &key) {
            Some(scope) => {
                self.fail_scope(&mut state::lock(&scope), TOOL, error);
                state.remove(&key);
            }
            None => warn!(tool = tool_name, error, "No tool scope at on_tool_error"),
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ObservabilityPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityPlugin")
            .field("registry", &self.registry)
            .field("metrics", &self.metrics)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens_is_bytes_over_four() {
        // {"city":"Paris"} is 16 bytes.
        assert_eq!(estimate_tokens(&json!({"city": "Paris"})), 4);
        assert_eq!(estimate_tokens(&json!("ab")), 1);
        assert_eq!(estimate_tokens(&Value::Null), 1);
    }
}
