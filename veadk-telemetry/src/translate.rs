//! Translation of host framework spans into the own trace.
//!
//! The host's `tracing` spans reach OpenTelemetry through the global pipeline.
//! Where the plugin has opened its own span for the same scope, the host span
//! is redundant and dropped. Host spans beneath a mapped trace (tool spans,
//! mostly) are moved into the own trace and re-parented onto own spans, and
//! their tool attributes are renamed to the canonical schema.

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::trace::{SpanContext, SpanId};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use std::sync::Arc;
use tracing::trace;

use crate::attributes::{
    GEN_AI_TOOL_CALL_ID, GEN_AI_TOOL_INPUT, GEN_AI_TOOL_OUTPUT, HOST_TOOL_ARGS, HOST_TOOL_RESPONSE,
    aliased,
};
use crate::registry::SpanRegistry;

#[derive(Debug)]
pub struct HostSpanTranslator<E> {
    inner: E,
    registry: Arc<SpanRegistry>,
}

impl<E: SpanExporter> HostSpanTranslator<E> {
    pub fn new(inner: E, registry: Arc<SpanRegistry>) -> Self {
        Self { inner, registry }
    }

    /// `None` when the span is superseded by an own span.
    pub fn translate(&self, mut span: SpanData) -> Option<SpanData> {
        let host = span.span_context.clone();
        if self.registry.get_own_span_context(host.span_id()).is_some() {
            trace!(span = %span.name, "Dropping host span superseded by own span");
            return None;
        }

        if let Some(own_trace_id) = self.registry.get_own_trace_id(host.trace_id()) {
            let parent = tool_call_id(&span.attributes)
                .and_then(|id| self.registry.get_own_parent_by_tool_call_id(id))
                .or_else(|| self.registry.get_own_span_context(span.parent_span_id));
            if let Some(parent) = parent {
                span.parent_span_id = parent.span_id();
            } else if span.parent_span_id != SpanId::INVALID {
                trace!(span = %span.name, "No own parent for host span, keeping host parent");
            }
            span.span_context = SpanContext::new(
                own_trace_id,
                host.span_id(),
                host.trace_flags(),
                host.is_remote(),
                host.trace_state().clone(),
            );
        }

        span.attributes = rename_tool_attributes(std::mem::take(&mut span.attributes));
        Some(span)
    }
}

impl<E: SpanExporter> SpanExporter for HostSpanTranslator<E> {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let translated: Vec<SpanData> =
            batch.into_iter().filter_map(|span| self.translate(span)).collect();
        if translated.is_empty() {
            return Box::pin(async { Ok(()) });
        }
        self.inner.export(translated)
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }

    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        self.inner.force_flush()
    }
}

fn tool_call_id(attributes: &[KeyValue]) -> Option<&str> {
    let attribute = attributes.iter().find(|kv| kv.key.as_str() == GEN_AI_TOOL_CALL_ID)?;
    match &attribute.value {
        opentelemetry::Value::String(id) if !id.as_str().is_empty() => Some(id.as_str()),
        _ => None,
    }
}

fn rename_tool_attributes(attributes: Vec<KeyValue>) -> Vec<KeyValue> {
    let mut renamed = Vec::with_capacity(attributes.len());
    for kv in attributes {
        match kv.key.as_str() {
            HOST_TOOL_ARGS => renamed.extend(aliased(GEN_AI_TOOL_INPUT, kv.value)),
            HOST_TOOL_RESPONSE => renamed.extend(aliased(GEN_AI_TOOL_OUTPUT, kv.value)),
            _ => renamed.push(kv),
        }
    }
    renamed
}
