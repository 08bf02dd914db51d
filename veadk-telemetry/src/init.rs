//! One-time initialization, logging, and shutdown.

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer, TracerProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ObservabilityConfig, OpenTelemetryConfig};
use crate::error::TelemetryError;
use crate::exporter::{self, BoxedExporter};
use crate::metrics::{self, MetricsRegistry};
use crate::plugin::ObservabilityPlugin;
use crate::registry::SpanRegistry;
use crate::resolver::ContextResolver;
use crate::translate::HostSpanTranslator;

const INSTRUMENTATION_NAME: &str = "veadk-telemetry";

static LOGGING: Once = Once::new();
static OBSERVABILITY: OnceLock<Observability> = OnceLock::new();
static SIGNAL_HANDLER: Once = Once::new();

/// Initialize console logging
///
/// Installs a `tracing` subscriber with an `EnvFilter` (`RUST_LOG`, default
/// `info`). Only the first call in a process has any effect.
///
/// # Example
/// ```
/// veadk_telemetry::init_logging("my-agent-service");
/// ```
pub fn init_logging(service_name: &str) {
    LOGGING.call_once(|| {
        let installed =
            tracing_subscriber::registry().with(env_filter()).with(fmt_layer()).try_init();
        match installed {
            Ok(()) => info!(service.name = service_name, "Logging initialized"),
            Err(e) => debug!(error = %e, "A global subscriber is already installed"),
        }
    });
}

/// Initialize console logging and bridge `tracing` spans into OpenTelemetry
///
/// Spans the host opens with `tracing` are exported through `tracer`, which is
/// normally [`Observability::host_tracer`].
pub fn init_logging_with_tracer(service_name: &str, tracer: Tracer) {
    LOGGING.call_once(|| {
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init();
        match installed {
            Ok(()) => {
                info!(service.name = service_name, "Logging initialized with OpenTelemetry bridge")
            }
            Err(e) => debug!(error = %e, "A global subscriber is already installed"),
        }
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true)
}

/// Process-wide observability state: providers, registries, and the resolver.
pub struct Observability {
    tracer: Tracer,
    local_provider: TracerProvider,
    global_provider: Option<TracerProvider>,
    local_meter_provider: Option<SdkMeterProvider>,
    global_meter_provider: Option<SdkMeterProvider>,
    registry: Arc<SpanRegistry>,
    metrics: Arc<MetricsRegistry>,
    resolver: Arc<ContextResolver>,
    setup_error: Option<TelemetryError>,
    install_signal_handler: bool,
    shut_down: AtomicBool,
}

impl Observability {
    /// Initializes the process-wide instance on first call and returns it.
    ///
    /// Later calls return the existing instance and ignore `config`. Setup
    /// problems never fail initialization; they leave the instance in
    /// degraded mode, see [`Observability::setup_error`].
    pub fn init(config: ObservabilityConfig) -> &'static Observability {
        let observability = OBSERVABILITY.get_or_init(|| {
            let registry = SpanRegistry::global_with(&config.opentelemetry.registry);
            Observability::build(config, registry)
        });
        if observability.install_signal_handler {
            install_signal_handler(observability);
        }
        observability
    }

    pub fn get() -> Option<&'static Observability> {
        OBSERVABILITY.get()
    }

    /// Builds a standalone instance with its own span registry. Prefer
    /// [`Observability::init`] outside tests.
    pub fn new(config: ObservabilityConfig) -> Self {
        let registry = Arc::new(SpanRegistry::new(&config.opentelemetry.registry));
        Self::build(config, registry)
    }

    fn build(config: ObservabilityConfig, registry: Arc<SpanRegistry>) -> Self {
        let otel = &config.opentelemetry;
        let resource =
            Resource::new(vec![KeyValue::new("service.name", config.service_name().to_string())]);
        let mut setup_error = None;

        // Always built: in degraded mode own spans are still created, just not exported.
        let mut local = tracer_provider_builder(&resource);
        if otel.enable_local_tracer {
            match exporter::build_exporter(otel) {
                Ok(exporter) => local = with_exporter(local, BoxedExporter(exporter)),
                Err(e) => {
                    let recoverable = e.is_recoverable();
                    warn!(error = %e, recoverable, "Spans will not be exported");
                    setup_error = Some(e);
                }
            }
        }
        let local_provider = local.build();

        let mut global_provider = None;
        if otel.enable_global_tracer {
            match exporter::build_exporter(otel) {
                Ok(exporter) => {
                    let translator =
                        HostSpanTranslator::new(BoxedExporter(exporter), registry.clone());
                    let provider =
                        with_exporter(tracer_provider_builder(&resource), translator).build();
                    global::set_tracer_provider(provider.clone());
                    global_provider = Some(provider);
                }
                Err(e) => {
                    warn!(error = %e, "Global tracer provider not installed");
                    setup_error.get_or_insert(e);
                }
            }
        }

        if !otel.enable_local_tracer && !otel.enable_global_tracer {
            warn!("Local and global tracers are both disabled, spans will not be exported");
            setup_error.get_or_insert(TelemetryError::NoTracer);
        }

        // Own spans take the global pipeline only when it replaces the local one.
        let tracer = match &global_provider {
            Some(global) if !otel.enable_local_tracer => global.tracer(INSTRUMENTATION_NAME),
            _ => local_provider.tracer(INSTRUMENTATION_NAME),
        };

        let meter_provider = |enabled: bool| {
            (otel.enable_metrics && enabled).then(|| build_meter_provider(otel, &resource))
        };
        let local_meter_provider = meter_provider(otel.enable_local_tracer);
        let global_meter_provider = meter_provider(otel.enable_global_tracer);
        if let Some(provider) = &global_meter_provider {
            global::set_meter_provider(provider.clone());
        }
        let metrics = if otel.enable_metrics {
            let meters: Vec<Meter> = local_meter_provider
                .iter()
                .chain(global_meter_provider.iter())
                .map(|provider| provider.meter(INSTRUMENTATION_NAME))
                .collect();
            MetricsRegistry::new(meters)
        } else {
            MetricsRegistry::disabled()
        };

        info!(
            service.name = config.service_name(),
            local_tracer = otel.enable_local_tracer,
            global_tracer = otel.enable_global_tracer,
            metrics = otel.enable_metrics,
            meters = metrics.meter_count(),
            degraded = setup_error.is_some(),
            "Observability initialized"
        );

        Self {
            tracer,
            local_provider,
            global_provider,
            local_meter_provider,
            global_meter_provider,
            registry,
            metrics: Arc::new(metrics),
            resolver: Arc::new(ContextResolver::new(&config)),
            setup_error,
            install_signal_handler: otel.install_signal_handler,
            shut_down: AtomicBool::new(false),
        }
    }

    /// A plugin wired to this instance.
    pub fn plugin(&self) -> ObservabilityPlugin {
        ObservabilityPlugin::new(
            self.tracer.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.resolver.clone(),
        )
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Tracer of the global provider, for [`init_logging_with_tracer`].
    pub fn host_tracer(&self) -> Option<Tracer> {
        self.global_provider.as_ref().map(|provider| provider.tracer(INSTRUMENTATION_NAME))
    }

    pub fn registry(&self) -> &Arc<SpanRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn resolver(&self) -> &Arc<ContextResolver> {
        &self.resolver
    }

    /// The setup problem that put this instance in degraded mode, if any.
    pub fn setup_error(&self) -> Option<&TelemetryError> {
        self.setup_error.as_ref()
    }

    pub fn is_degraded(&self) -> bool {
        self.setup_error.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Ends open invocation spans, then flushes and stops everything. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ended = self.registry.end_all_invocation_spans();
        self.registry.shutdown();

        let providers = std::iter::once(&self.local_provider).chain(self.global_provider.as_ref());
        for result in providers.flat_map(TracerProvider::force_flush) {
            if let Err(e) = result {
                warn!(error = %e, "Span flush failed");
            }
        }
        let meter_providers =
            self.local_meter_provider.iter().chain(self.global_meter_provider.iter());
        for result in meter_providers.map(SdkMeterProvider::shutdown) {
            if let Err(e) = result {
                warn!(error = %e, "Meter provider shutdown failed");
            }
        }
        if self.global_provider.is_some() {
            global::shutdown_tracer_provider();
        }
        if self.global_meter_provider.is_some() {
            global::shutdown_meter_provider();
        }
        info!(ended_invocations = ended, "Observability shut down");
    }
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability")
            .field("registry", &self.registry)
            .field("metrics", &self.metrics)
            .field("setup_error", &self.setup_error)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn tracer_provider_builder(resource: &Resource) -> sdktrace::Builder {
    TracerProvider::builder().with_config(sdktrace::config().with_resource(resource.clone()))
}

/// Batch processors and periodic readers block on their runtime task when
/// flushing, so they need a multi-threaded runtime.
fn on_multi_thread_runtime() -> bool {
    matches!(
        Handle::try_current().map(|handle| handle.runtime_flavor()),
        Ok(RuntimeFlavor::MultiThread)
    )
}

/// Batch export on a multi-threaded runtime; anywhere else spans are
/// exported as they end.
fn with_exporter<E>(builder: sdktrace::Builder, exporter: E) -> sdktrace::Builder
where
    E: opentelemetry_sdk::export::trace::SpanExporter + 'static,
{
    if on_multi_thread_runtime() {
        builder.with_batch_exporter(exporter, runtime::Tokio)
    } else {
        builder.with_simple_exporter(exporter)
    }
}

fn build_meter_provider(config: &OpenTelemetryConfig, resource: &Resource) -> SdkMeterProvider {
    let mut builder = SdkMeterProvider::builder().with_resource(resource.clone());
    for view in metrics::histogram_views() {
        builder = builder.with_view(view);
    }

    if !on_multi_thread_runtime() {
        debug!("No multi-threaded tokio runtime, metrics are recorded but not exported");
        return builder.build();
    }
    match exporter::build_metric_readers(config) {
        Ok(readers) => {
            for reader in readers {
                builder = builder.with_reader(reader);
            }
        }
        Err(e) => warn!(error = %e, "Metrics will not be exported"),
    }
    builder.build()
}

fn install_signal_handler(observability: &'static Observability) {
    SIGNAL_HANDLER.call_once(|| {
        let Ok(handle) = Handle::try_current() else {
            debug!("No tokio runtime, signal handler not installed");
            return;
        };
        handle.spawn(async move {
            let Some(code) = wait_for_signal().await else {
                return;
            };
            info!(exit_code = code, "Signal received, flushing telemetry");
            observability.shutdown();
            std::process::exit(code);
        });
        debug!("Signal handler installed");
    });
}

/// Resolves with the conventional exit code for the signal received.
#[cfg(unix)]
async fn wait_for_signal() -> Option<i32> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            return tokio::signal::ctrl_c().await.ok().map(|()| 130);
        }
    };
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => interrupted.ok().map(|()| 130),
        _ = terminate.recv() => Some(143),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<i32> {
    tokio::signal::ctrl_c().await.ok().map(|()| 130)
}
