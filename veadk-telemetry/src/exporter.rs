//! Export destinations and the fan-out exporter.
//!
//! Up to five destinations can be enabled at once: stdout, a local file, and
//! the three authenticated OTLP backends. A single destination is used as is;
//! several are combined into a [`FanoutExporter`] that forwards every batch to
//! all of them.

use futures::future::{BoxFuture, join_all};
use opentelemetry::trace::TraceError;
use opentelemetry_otlp::{MetricsExporterBuilder, SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::metrics::PeriodicReader;
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::runtime;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::{debug, info, warn};

use crate::config::{Backend, BackendConfig, OpenTelemetryConfig};
use crate::error::{ExportErrors, Result, TelemetryError};

/// One enabled export destination.
#[derive(Debug, Clone)]
pub enum Destination {
    Stdout,
    File(PathBuf),
    Otlp { backend: Backend, config: BackendConfig },
}

impl Destination {
    pub fn name(&self) -> &'static str {
        match self {
            Destination::Stdout => "stdout",
            Destination::File(_) => "file",
            Destination::Otlp { backend, .. } => backend.as_str(),
        }
    }
}

/// Every destination enabled in `config`, in a fixed order.
pub fn destinations(config: &OpenTelemetryConfig) -> Vec<Destination> {
    let mut destinations = Vec::new();
    if config.stdout.enable {
        destinations.push(Destination::Stdout);
    }
    if let Some(path) = config.file.path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        destinations.push(Destination::File(path.clone()));
    }
    for (backend, backend_config) in config.enabled_backends() {
        destinations.push(Destination::Otlp { backend, config: backend_config.clone() });
    }
    destinations
}

/// Builds the span exporter for `config`.
///
/// Returns [`TelemetryError::NoExporters`] when nothing is enabled.
pub fn build_exporter(config: &OpenTelemetryConfig) -> Result<Box<dyn SpanExporter>> {
    let mut exporters = Vec::new();
    for destination in destinations(config) {
        let exporter = build_span_exporter(&destination)?;
        info!(destination = destination.name(), "Span exporter configured");
        exporters.push((destination.name().to_string(), exporter));
    }

    match exporters.len() {
        0 => Err(TelemetryError::NoExporters),
        1 => Ok(exporters.remove(0).1),
        _ => Ok(Box::new(FanoutExporter::new(exporters))),
    }
}

/// One periodic metric reader per enabled destination.
///
/// Readers push on the tokio runtime, so this must run inside one.
pub fn build_metric_readers(config: &OpenTelemetryConfig) -> Result<Vec<PeriodicReader>> {
    destinations(config).iter().map(build_metric_reader).collect()
}

fn build_span_exporter(destination: &Destination) -> Result<Box<dyn SpanExporter>> {
    match destination {
        Destination::Stdout => Ok(Box::new(opentelemetry_stdout::SpanExporter::default())),
        Destination::File(path) => {
            let file = open_append(path)?;
            Ok(Box::new(opentelemetry_stdout::SpanExporter::builder().with_writer(file).build()))
        }
        Destination::Otlp { backend, config } => {
            let endpoint = normalize_endpoint(*backend, &config.endpoint)?;
            let headers = config.headers(*backend)?;
            let builder: SpanExporterBuilder = if config.is_http() {
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(signal_endpoint(&endpoint, "traces"))
                    .with_headers(header_map(&headers))
                    .into()
            } else {
                require_runtime(*backend)?;
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint)
                    .with_metadata(metadata_map(*backend, &headers)?)
                    .into()
            };
            let exporter = builder.build_span_exporter().map_err(|e| TelemetryError::Exporter {
                destination: backend.as_str(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(exporter))
        }
    }
}

fn build_metric_reader(destination: &Destination) -> Result<PeriodicReader> {
    let reader = match destination {
        Destination::Stdout => {
            let exporter = opentelemetry_stdout::MetricsExporter::default();
            PeriodicReader::builder(exporter, runtime::Tokio).build()
        }
        Destination::File(path) => {
            let exporter = opentelemetry_stdout::MetricsExporter::builder()
                .with_writer(open_append(path)?)
                .build();
            PeriodicReader::builder(exporter, runtime::Tokio).build()
        }
        Destination::Otlp { backend, config } => {
            let endpoint = normalize_endpoint(*backend, &config.endpoint)?;
            let headers = config.headers(*backend)?;
            let builder: MetricsExporterBuilder = if config.is_http() {
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(signal_endpoint(&endpoint, "metrics"))
                    .with_headers(header_map(&headers))
                    .into()
            } else {
                require_runtime(*backend)?;
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint)
                    .with_metadata(metadata_map(*backend, &headers)?)
                    .into()
            };
            let exporter = builder
                .build_metrics_exporter(
                    Box::new(DefaultTemporalitySelector::new()),
                    Box::new(DefaultAggregationSelector::new()),
                )
                .map_err(|e| TelemetryError::Exporter {
                    destination: backend.as_str(),
                    reason: e.to_string(),
                })?;
            PeriodicReader::builder(exporter, runtime::Tokio).build()
        }
    };
    debug!(destination = destination.name(), "Metric reader configured");
    Ok(reader)
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn require_runtime(backend: Backend) -> Result<()> {
    tokio::runtime::Handle::try_current().map(|_| ()).map_err(|_| TelemetryError::Exporter {
        destination: backend.as_str(),
        reason: "gRPC export needs a running tokio runtime".to_string(),
    })
}

/// Adds a scheme to bare `host:port` endpoints and checks the result parses.
fn normalize_endpoint(backend: Backend, endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let invalid = || TelemetryError::InvalidEndpoint {
        destination: backend.as_str(),
        endpoint: endpoint.to_string(),
    };

    let parsed = url::Url::parse(&candidate).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(candidate.trim_end_matches('/').to_string())
}

/// OTLP/HTTP posts each signal to its own path.
fn signal_endpoint(endpoint: &str, signal: &str) -> String {
    let suffix = format!("/v1/{signal}");
    if endpoint.ends_with(&suffix) {
        endpoint.to_string()
    } else {
        format!("{endpoint}{suffix}")
    }
}

fn header_map(headers: &[(&'static str, String)]) -> HashMap<String, String> {
    headers.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
}

fn metadata_map(backend: Backend, headers: &[(&'static str, String)]) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        let value = MetadataValue::try_from(value.as_str()).map_err(|e| TelemetryError::Exporter {
            destination: backend.as_str(),
            reason: format!("invalid value for header {name}: {e}"),
        })?;
        metadata.insert(*name, value);
    }
    Ok(metadata)
}

/// Forwards every call to all child exporters.
///
/// A failing child never prevents the others from being called; every
/// failure is collected into one [`ExportErrors`].
pub struct FanoutExporter {
    exporters: Vec<(String, Box<dyn SpanExporter>)>,
}

impl FanoutExporter {
    pub fn new(exporters: Vec<(String, Box<dyn SpanExporter>)>) -> Self {
        Self { exporters }
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    fn join(
        &mut self,
        call: impl Fn(&mut Box<dyn SpanExporter>) -> BoxFuture<'static, ExportResult>,
    ) -> BoxFuture<'static, ExportResult> {
        let total = self.exporters.len();
        let pending: Vec<_> = self
            .exporters
            .iter_mut()
            .map(|(name, exporter)| (name.clone(), call(exporter)))
            .collect();

        Box::pin(async move {
            let (names, futures): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
            let results = join_all(futures).await;

            let mut errors = ExportErrors::new(total);
            for (name, result) in names.iter().zip(results) {
                if let Err(e) = result {
                    warn!(destination = name.as_str(), error = %e, "Export failed");
                    errors.push(name, e);
                }
            }
            errors.into_result().map_err(TraceError::from)
        })
    }
}

impl SpanExporter for FanoutExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.join(|exporter| exporter.export(batch.clone()))
    }

    fn shutdown(&mut self) {
        for (name, exporter) in &mut self.exporters {
            debug!(destination = name.as_str(), "Shutting down exporter");
            exporter.shutdown();
        }
    }

    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        self.join(|exporter| exporter.force_flush())
    }
}

impl std::fmt::Debug for FanoutExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.exporters.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("FanoutExporter").field("exporters", &names).finish()
    }
}

/// Owns whatever [`build_exporter`] produced so it can be handed to a span processor.
#[derive(Debug)]
pub struct BoxedExporter(pub Box<dyn SpanExporter>);

impl SpanExporter for BoxedExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.0.export(batch)
    }

    fn shutdown(&mut self) {
        self.0.shutdown();
    }

    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        self.0.force_flush()
    }
}
