//! # VeADK Telemetry
//!
//! OpenTelemetry observability for VeADK agents.
//!
//! ## Features
//! - A lifecycle plugin that turns flat host callbacks into one span tree per
//!   invocation: invocation, agent, model call, tool call
//! - Correlation of host framework spans with own spans through a shared registry
//! - GenAI metrics (token usage, latency, first-token time) on local and global meters
//! - Fan-out export to stdout, a file, and authenticated OTLP backends
//! - Structured logging with `tracing`
//!
//! ## Usage
//!
//! ```no_run
//! use veadk_telemetry::{Observability, ObservabilityConfig, init_logging};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! init_logging("travel-agent");
//! let config = ObservabilityConfig::from_file("observability.toml")?;
//! let observability = Observability::init(config);
//! if let Some(e) = observability.setup_error() {
//!     tracing::warn!(error = %e, "Running without span export");
//! }
//! let plugin = observability.plugin();
//! // register `plugin` with the host's plugin manager
//! # drop(plugin);
//! observability.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod attributes;
pub mod config;
pub mod error;
pub mod exporter;
pub mod init;
pub mod metrics;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod translate;

pub use config::{Backend, BackendConfig, ObservabilityConfig, OpenTelemetryConfig, RegistryConfig};
pub use error::{ExportErrors, Result, TelemetryError};
pub use exporter::{
    BoxedExporter, Destination, FanoutExporter, build_exporter, build_metric_readers,
};
pub use init::{Observability, init_logging, init_logging_with_tracer};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use plugin::{ObservabilityPlugin, StreamAccumulator, estimate_tokens};
pub use registry::SpanRegistry;
pub use resolver::{ContextField, ContextResolver};
pub use scope::ScopePhase;
pub use translate::HostSpanTranslator;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
