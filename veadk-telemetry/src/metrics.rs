//! GenAI client metrics.
//!
//! The following instruments are created on every active meter:
//! - `gen_ai.client.token.usage` - Tokens per model call, split by `gen_ai.token.type` (histogram)
//! - `gen_ai.client.operation.duration` - Invocation, model and tool call duration (histogram)
//! - `gen_ai.chat_completions.streaming_time_to_first_token` - First-token latency (histogram)
//! - `gen_ai.chat.count` - Completed model calls (counter)
//! - `gen_ai.chat_completions.exceptions` - Failed model and tool calls (counter)
//! - `gen_ai.chat_completions.streaming_time_to_generate` - First token to completion (histogram)
//! - `gen_ai.chat_completions.streaming_time_per_output_token` - Time per output token (histogram)
//! - `gen_ai.tool.token.usage` - Estimated tool payload tokens (histogram)
//! - `apmplus_span_latency` - Span latency, mirrored from operation duration (histogram)

use dashmap::DashMap;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use opentelemetry_sdk::metrics::{Aggregation, Instrument, Stream, View, new_view};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::attributes::GEN_AI_TOKEN_TYPE;

pub const TOKEN_USAGE: &str = "gen_ai.client.token.usage";
pub const OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
pub const FIRST_TOKEN_LATENCY: &str = "gen_ai.chat_completions.streaming_time_to_first_token";
pub const CHAT_COUNT: &str = "gen_ai.chat.count";
pub const EXCEPTIONS: &str = "gen_ai.chat_completions.exceptions";
pub const TIME_TO_GENERATE: &str = "gen_ai.chat_completions.streaming_time_to_generate";
pub const TIME_PER_OUTPUT_TOKEN: &str = "gen_ai.chat_completions.streaming_time_per_output_token";
pub const TOOL_TOKEN_USAGE: &str = "gen_ai.tool.token.usage";
pub const SPAN_LATENCY: &str = "apmplus_span_latency";

/// Seconds, 10ms to ~5.5min.
pub const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92, 163.84,
    327.68,
];

pub const TOKEN_BUCKETS: &[f64] = &[
    1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
    16777216.0, 67108864.0,
];

/// Seconds, 1ms to 10s.
pub const FIRST_TOKEN_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.02, 0.04, 0.06, 0.08, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

pub const PER_TOKEN_BUCKETS: &[f64] =
    &[0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.75, 1.0, 2.5];

/// Explicit-bucket views for the histograms above.
pub fn histogram_views() -> Vec<Box<dyn View>> {
    let specs: [(&str, &[f64]); 8] = [
        (TOKEN_USAGE, TOKEN_BUCKETS),
        (TOOL_TOKEN_USAGE, TOKEN_BUCKETS),
        (OPERATION_DURATION, DURATION_BUCKETS),
        (SPAN_LATENCY, DURATION_BUCKETS),
        (TIME_TO_GENERATE, DURATION_BUCKETS),
        (FIRST_TOKEN_LATENCY, FIRST_TOKEN_BUCKETS),
        (TIME_PER_OUTPUT_TOKEN, PER_TOKEN_BUCKETS),
        ("veadk.*", DURATION_BUCKETS),
    ];

    specs
        .into_iter()
        .filter_map(|(name, boundaries)| {
            let aggregation = Aggregation::ExplicitBucketHistogram {
                boundaries: boundaries.to_vec(),
                record_min_max: true,
            };
            match new_view(Instrument::new().name(name), Stream::new().aggregation(aggregation)) {
                Ok(view) => Some(view),
                Err(e) => {
                    warn!(instrument = name, error = %e, "Skipping histogram view");
                    None
                }
            }
        })
        .collect()
}

/// Instruments of one meter. A `None` instrument failed to initialize and is skipped.
struct Instruments {
    token_usage: Option<Histogram<u64>>,
    operation_duration: Option<Histogram<f64>>,
    first_token_latency: Option<Histogram<f64>>,
    chat_count: Option<Counter<u64>>,
    exceptions: Option<Counter<u64>>,
    time_to_generate: Option<Histogram<f64>>,
    time_per_output_token: Option<Histogram<f64>>,
    tool_token_usage: Option<Histogram<u64>>,
    span_latency: Option<Histogram<f64>>,
}

fn tolerate<T, E: std::fmt::Display>(name: &str, result: Result<T, E>) -> Option<T> {
    result.map_err(|e| warn!(instrument = name, error = %e, "Failed to create instrument")).ok()
}

impl Instruments {
    fn new(meter: &Meter) -> Self {
        let seconds = || Unit::new("s");
        let tokens = || Unit::new("{token}");
        let f64_histogram = |name: &'static str, description: &'static str| {
            let histogram =
                meter.f64_histogram(name).with_description(description).with_unit(seconds());
            tolerate(name, histogram.try_init())
        };

        Self {
            token_usage: tolerate(
                TOKEN_USAGE,
                meter
                    .u64_histogram(TOKEN_USAGE)
                    .with_description("Measures number of input and output tokens used")
                    .with_unit(tokens())
                    .try_init(),
            ),
            operation_duration: f64_histogram(OPERATION_DURATION, "GenAI operation duration"),
            first_token_latency: f64_histogram(
                FIRST_TOKEN_LATENCY,
                "Time to first token in streaming chat completions",
            ),
            chat_count: tolerate(
                CHAT_COUNT,
                meter
                    .u64_counter(CHAT_COUNT)
                    .with_description("Number of completed chat calls")
                    .try_init(),
            ),
            exceptions: tolerate(
                EXCEPTIONS,
                meter
                    .u64_counter(EXCEPTIONS)
                    .with_description("Number of failed chat and tool calls")
                    .try_init(),
            ),
            time_to_generate: f64_histogram(
                TIME_TO_GENERATE,
                "Time from the first token to the end of generation",
            ),
            time_per_output_token: f64_histogram(
                TIME_PER_OUTPUT_TOKEN,
                "Generation time per output token",
            ),
            tool_token_usage: tolerate(
                TOOL_TOKEN_USAGE,
                meter
                    .u64_histogram(TOOL_TOKEN_USAGE)
                    .with_description("Estimated tokens of tool input and output (bytes / 4)")
                    .with_unit(tokens())
                    .try_init(),
            ),
            span_latency: f64_histogram(SPAN_LATENCY, "Latency of invocation and call spans"),
        }
    }
}

struct MeterSource {
    meter: Meter,
    instruments: OnceLock<Instruments>,
    named: DashMap<String, Option<Histogram<f64>>>,
}

impl MeterSource {
    fn instruments(&self) -> &Instruments {
        self.instruments.get_or_init(|| Instruments::new(&self.meter))
    }

    fn named_histogram(&self, name: &str) -> Option<Histogram<f64>> {
        if let Some(existing) = self.named.get(name) {
            return existing.value().clone();
        }
        let created = tolerate(
            name,
            self.meter.f64_histogram(name.to_string()).with_unit(Unit::new("s")).try_init(),
        );
        self.named.entry(name.to_string()).or_insert(created).value().clone()
    }
}

/// Measurement totals, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub chat_count: u64,
    pub exceptions: u64,
    pub first_token_records: u64,
    pub operation_duration_records: u64,
    pub span_latency_records: u64,
    pub time_to_generate_records: u64,
    pub time_per_output_token_records: u64,
    pub tool_input_tokens: u64,
    pub tool_output_tokens: u64,
    pub named_duration_records: u64,
}

#[derive(Default)]
struct Totals {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    chat_count: AtomicU64,
    exceptions: AtomicU64,
    first_token_records: AtomicU64,
    operation_duration_records: AtomicU64,
    span_latency_records: AtomicU64,
    time_to_generate_records: AtomicU64,
    time_per_output_token_records: AtomicU64,
    tool_input_tokens: AtomicU64,
    tool_output_tokens: AtomicU64,
    named_duration_records: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Records every measurement on each registered meter (none, local, or local and global).
pub struct MetricsRegistry {
    sources: Vec<MeterSource>,
    enabled: bool,
    totals: Totals,
}

impl MetricsRegistry {
    pub fn new(meters: Vec<Meter>) -> Self {
        let sources = meters
            .into_iter()
            .map(|meter| MeterSource { meter, instruments: OnceLock::new(), named: DashMap::new() })
            .collect::<Vec<_>>();
        debug!(meters = sources.len(), "Metrics registry created");
        Self { sources, enabled: true, totals: Totals::default() }
    }

    /// A registry that records nothing.
    pub fn disabled() -> Self {
        Self { sources: Vec::new(), enabled: false, totals: Totals::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn meter_count(&self) -> usize {
        self.sources.len()
    }

    fn each(&self, f: impl Fn(&Instruments)) {
        for source in &self.sources {
            f(source.instruments());
        }
    }

    /// Two measurements, tagged `input` and `output`.
    pub fn record_token_usage(&self, input: u64, output: u64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        let input_attributes = with_token_type(attributes, "input");
        let output_attributes = with_token_type(attributes, "output");
        self.each(|i| {
            if let Some(histogram) = &i.token_usage {
                histogram.record(input, &input_attributes);
                histogram.record(output, &output_attributes);
            }
        });
        bump(&self.totals.input_tokens, input);
        bump(&self.totals.output_tokens, output);
    }

    pub fn record_operation_duration(&self, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(histogram) = &i.operation_duration {
                histogram.record(seconds, attributes);
            }
        });
        bump(&self.totals.operation_duration_records, 1);
    }

    pub fn record_first_token_latency(&self, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(histogram) = &i.first_token_latency {
                histogram.record(seconds, attributes);
            }
        });
        bump(&self.totals.first_token_records, 1);
    }

    pub fn record_chat_count(&self, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(counter) = &i.chat_count {
                counter.add(1, attributes);
            }
        });
        bump(&self.totals.chat_count, 1);
    }

    pub fn record_exception(&self, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(counter) = &i.exceptions {
                counter.add(1, attributes);
            }
        });
        bump(&self.totals.exceptions, 1);
    }

    pub fn record_time_to_generate(&self, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(histogram) = &i.time_to_generate {
                histogram.record(seconds, attributes);
            }
        });
        bump(&self.totals.time_to_generate_records, 1);
    }

    pub fn record_time_per_output_token(&self, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(histogram) = &i.time_per_output_token {
                histogram.record(seconds, attributes);
            }
        });
        bump(&self.totals.time_per_output_token_records, 1);
    }

    /// Estimated tokens of a tool call's payloads, tagged `input` and `output`.
    pub fn record_tool_token_usage(&self, input: u64, output: u64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        let input_attributes = with_token_type(attributes, "input");
        let output_attributes = with_token_type(attributes, "output");
        self.each(|i| {
            if let Some(histogram) = &i.tool_token_usage {
                histogram.record(input, &input_attributes);
                histogram.record(output, &output_attributes);
            }
        });
        bump(&self.totals.tool_input_tokens, input);
        bump(&self.totals.tool_output_tokens, output);
    }

    pub fn record_span_latency(&self, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        self.each(|i| {
            if let Some(histogram) = &i.span_latency {
                histogram.record(seconds, attributes);
            }
        });
        bump(&self.totals.span_latency_records, 1);
    }

    /// Records a duration on a histogram created on first use under `name`.
    pub fn record_duration(&self, name: &str, seconds: f64, attributes: &[KeyValue]) {
        if !self.enabled {
            return;
        }
        for source in &self.sources {
            if let Some(histogram) = source.named_histogram(name) {
                histogram.record(seconds, attributes);
            }
        }
        bump(&self.totals.named_duration_records, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let t = &self.totals;
        MetricsSnapshot {
            input_tokens: load(&t.input_tokens),
            output_tokens: load(&t.output_tokens),
            chat_count: load(&t.chat_count),
            exceptions: load(&t.exceptions),
            first_token_records: load(&t.first_token_records),
            operation_duration_records: load(&t.operation_duration_records),
            span_latency_records: load(&t.span_latency_records),
            time_to_generate_records: load(&t.time_to_generate_records),
            time_per_output_token_records: load(&t.time_per_output_token_records),
            tool_input_tokens: load(&t.tool_input_tokens),
            tool_output_tokens: load(&t.tool_output_tokens),
            named_duration_records: load(&t.named_duration_records),
        }
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("meters", &self.sources.len())
            .field("enabled", &self.enabled)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn with_token_type(attributes: &[KeyValue], token_type: &'static str) -> Vec<KeyValue> {
    let mut tagged = Vec::with_capacity(attributes.len() + 1);
    tagged.extend_from_slice(attributes);
    tagged.push(KeyValue::new(GEN_AI_TOKEN_TYPE, token_type));
    tagged
}
