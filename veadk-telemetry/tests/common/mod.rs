#![allow(dead_code)]

use futures::future::BoxFuture;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId, TraceError, TraceFlags, TraceId, TraceState, Tracer as _,
    TracerProvider as _,
};
use opentelemetry::Value;
use opentelemetry::metrics::Result as MetricsResult;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::metrics::data::{self, Metric, ResourceMetrics, Temporality};
use opentelemetry_sdk::metrics::reader::{AggregationSelector, MetricReader, TemporalitySelector};
use opentelemetry_sdk::metrics::{
    Aggregation, InstrumentKind, ManualReader, MeterProvider as SdkMeterProvider, Pipeline,
};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{AttributeSet, Resource};
use std::sync::{Arc, Mutex, Weak};
use veadk_core::{
    CallbackContext, Content, InvocationContext, ReadonlyContext, RunConfig, TempState, ToolContext,
};
use veadk_telemetry::{
    ContextResolver, MetricsRegistry, ObservabilityConfig, ObservabilityPlugin, RegistryConfig,
    SpanRegistry,
};

/// Keeps every exported span.
#[derive(Debug, Clone, Default)]
pub struct RecordingExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
    batches: Arc<Mutex<usize>>,
}

impl RecordingExporter {
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    pub fn batch_count(&self) -> usize {
        *self.batches.lock().unwrap()
    }
}

impl SpanExporter for RecordingExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.spans.lock().unwrap().extend(batch);
        *self.batches.lock().unwrap() += 1;
        Box::pin(async { Ok(()) })
    }
}

/// Fails every export with a fixed message.
#[derive(Debug, Clone)]
pub struct FailingExporter {
    pub message: &'static str,
}

impl SpanExporter for FailingExporter {
    fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let message = self.message;
        Box::pin(async move { Err(TraceError::from(message)) })
    }
}

pub fn trace_id(id: u128) -> TraceId {
    TraceId::from(id)
}

pub fn span_id(id: u64) -> SpanId {
    SpanId::from(id)
}

pub fn span_context(trace: u128, span: u64) -> SpanContext {
    let flags = TraceFlags::SAMPLED;
    SpanContext::new(trace_id(trace), span_id(span), flags, false, TraceState::default())
}

/// A span that went through a real provider, as an exporter would receive it.
pub fn finished_span(name: &'static str) -> SpanData {
    let exporter = RecordingExporter::default();
    let provider = TracerProvider::builder().with_simple_exporter(exporter.clone()).build();
    provider.tracer("test").start(name).end();
    for result in provider.force_flush() {
        result.unwrap();
    }
    exporter.spans().remove(0)
}

pub fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes.iter().find(|kv| kv.key.as_str() == key).map(|kv| &kv.value)
}

pub fn string_attribute(span: &SpanData, key: &str) -> Option<String> {
    attribute(span, key).map(|value| value.as_str().into_owned())
}

pub fn int_attribute(span: &SpanData, key: &str) -> Option<i64> {
    match attribute(span, key) {
        Some(Value::I64(v)) => Some(*v),
        _ => None,
    }
}

/// A manual reader that stays readable after being handed to a provider.
#[derive(Debug, Clone, Default)]
pub struct SharedReader(Arc<ManualReader>);

impl SharedReader {
    /// Every metric collected so far, across scopes.
    pub fn metrics(&self) -> Vec<Metric> {
        let mut collected =
            ResourceMetrics { resource: Resource::empty(), scope_metrics: Vec::new() };
        MetricReader::collect(self, &mut collected).unwrap();
        collected.scope_metrics.into_iter().flat_map(|scope| scope.metrics).collect()
    }
}

impl AggregationSelector for SharedReader {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self.0.aggregation(kind)
    }
}

impl TemporalitySelector for SharedReader {
    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.0.temporality(kind)
    }
}

impl MetricReader for SharedReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.0.register_pipeline(pipeline);
    }

    fn collect(&self, metrics: &mut ResourceMetrics) -> MetricsResult<()> {
        self.0.collect(metrics)
    }

    fn force_flush(&self) -> MetricsResult<()> {
        self.0.force_flush()
    }

    fn shutdown(&self) -> MetricsResult<()> {
        self.0.shutdown()
    }
}

/// A meter provider with the histogram views applied, read through `reader`.
pub fn meter_provider(reader: &SharedReader) -> SdkMeterProvider {
    let mut builder = SdkMeterProvider::builder().with_reader(reader.clone());
    for view in veadk_telemetry::metrics::histogram_views() {
        builder = builder.with_view(view);
    }
    builder.build()
}

fn find<'a>(metrics: &'a [Metric], name: &str) -> &'a Metric {
    metrics
        .iter()
        .find(|metric| metric.name == name)
        .unwrap_or_else(|| panic!("no metric named {name}"))
}

pub fn has_metric(metrics: &[Metric], name: &str) -> bool {
    metrics.iter().any(|metric| metric.name == name)
}

pub fn histogram<'a, T: 'static>(metrics: &'a [Metric], name: &str) -> &'a data::Histogram<T> {
    find(metrics, name)
        .data
        .as_any()
        .downcast_ref::<data::Histogram<T>>()
        .unwrap_or_else(|| panic!("{name} is not a histogram of the expected type"))
}

pub fn sum<'a, T: 'static>(metrics: &'a [Metric], name: &str) -> &'a data::Sum<T> {
    find(metrics, name)
        .data
        .as_any()
        .downcast_ref::<data::Sum<T>>()
        .unwrap_or_else(|| panic!("{name} is not a sum of the expected type"))
}

pub fn has_attribute(attributes: &AttributeSet, key: &str, value: &str) -> bool {
    attributes.iter().any(|(k, v)| k.as_str() == key && v.as_str() == value)
}

/// One host context. Contexts of the same invocation share their temp state.
pub struct TestContext {
    agent: String,
    call_id: String,
    host_span: Option<SpanContext>,
    content: Content,
    state: Arc<TempState>,
    run_config: RunConfig,
}

impl TestContext {
    pub fn invocation(user_text: &str) -> Self {
        Self {
            agent: "weather_agent".to_string(),
            call_id: String::new(),
            host_span: None,
            content: Content::new("user").with_text(user_text),
            state: Arc::new(TempState::new()),
            run_config: RunConfig::default(),
        }
    }

    /// A sibling context of the same invocation.
    pub fn scope(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            call_id: String::new(),
            host_span: None,
            content: self.content.clone(),
            state: self.state.clone(),
            run_config: self.run_config.clone(),
        }
    }

    pub fn agent(mut self, name: &str) -> Self {
        self.agent = name.to_string();
        self
    }

    pub fn call(mut self, call_id: &str) -> Self {
        self.call_id = call_id.to_string();
        self
    }

    pub fn host(mut self, host_span: SpanContext) -> Self {
        self.host_span = Some(host_span);
        self
    }

    pub fn state(&self) -> &TempState {
        &self.state
    }

    pub fn into_invocation(self) -> Arc<dyn InvocationContext> {
        Arc::new(self)
    }

    pub fn into_callback(self) -> Arc<dyn CallbackContext> {
        Arc::new(self)
    }

    pub fn into_tool(self) -> Arc<dyn ToolContext> {
        Arc::new(self)
    }
}

impl ReadonlyContext for TestContext {
    fn invocation_id(&self) -> &str {
        "e-42"
    }
    fn agent_name(&self) -> &str {
        &self.agent
    }
    fn user_id(&self) -> &str {
        "alice"
    }
    fn app_name(&self) -> &str {
        "weather_app"
    }
    fn session_id(&self) -> &str {
        "s-1"
    }
    fn branch(&self) -> &str {
        ""
    }
    fn user_content(&self) -> &Content {
        &self.content
    }
    fn host_span(&self) -> Option<SpanContext> {
        self.host_span.clone()
    }
}

impl CallbackContext for TestContext {
    fn temp_state(&self) -> &TempState {
        &self.state
    }
}

impl InvocationContext for TestContext {
    fn run_config(&self) -> &RunConfig {
        &self.run_config
    }
    fn end_invocation(&self) {}
    fn ended(&self) -> bool {
        false
    }
}

impl ToolContext for TestContext {
    fn function_call_id(&self) -> &str {
        &self.call_id
    }
}

/// A plugin wired to in-memory span and metric sinks.
pub struct Harness {
    pub provider: TracerProvider,
    pub exporter: RecordingExporter,
    pub meter_provider: SdkMeterProvider,
    pub reader: SharedReader,
    pub registry: Arc<SpanRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub plugin: ObservabilityPlugin,
}

impl Harness {
    pub fn new() -> Self {
        let exporter = RecordingExporter::default();
        let provider = TracerProvider::builder().with_simple_exporter(exporter.clone()).build();
        let reader = SharedReader::default();
        let meter_provider = meter_provider(&reader);
        let registry = Arc::new(SpanRegistry::new(&RegistryConfig::default()));
        let metrics = Arc::new(MetricsRegistry::new(vec![meter_provider.meter("test")]));

        let config = ObservabilityConfig {
            app_name: "weather_app".to_string(),
            model_provider: "openai".to_string(),
            ..Default::default()
        };
        let resolver = Arc::new(ContextResolver::new(&config).with_env(|_| None));
        let tracer = provider.tracer("test");
        let plugin = ObservabilityPlugin::new(tracer, registry.clone(), metrics.clone(), resolver);
        Self { provider, exporter, meter_provider, reader, registry, metrics, plugin }
    }

    /// Every span exported so far, after flushing the processor.
    pub fn spans(&self) -> Vec<SpanData> {
        for result in self.provider.force_flush() {
            result.unwrap();
        }
        self.exporter.spans()
    }

    pub fn span(&self, name: &str) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no span named {name}"))
    }
}
