//! Observability configuration, loaded from TOML.
//!
//! ```toml
//! app_name = "travel-agent"
//! model_provider = "openai"
//!
//! [opentelemetry]
//! enable_global_tracer = true
//!
//! [opentelemetry.stdout]
//! enable = true
//!
//! [opentelemetry.apmplus]
//! endpoint = "http://apmplus-cn-beijing.volces.com:4317"
//! api_key = "..."
//! service_name = "travel-agent"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TelemetryError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub app_name: String,
    pub model_provider: String,
    pub call_type: String,
    pub opentelemetry: OpenTelemetryConfig,
}

impl ObservabilityConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Service name reported on the resource: explicit setting, else the app name.
    pub fn service_name(&self) -> &str {
        if self.opentelemetry.service_name.is_empty() {
            &self.app_name
        } else {
            &self.opentelemetry.service_name
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenTelemetryConfig {
    pub enable_local_tracer: bool,
    pub enable_global_tracer: bool,
    pub enable_metrics: bool,
    pub service_name: String,
    pub install_signal_handler: bool,
    pub stdout: StdoutConfig,
    pub file: FileConfig,
    pub apmplus: BackendConfig,
    pub cozeloop: BackendConfig,
    pub tls: BackendConfig,
    pub registry: RegistryConfig,
}

impl Default for OpenTelemetryConfig {
    fn default() -> Self {
        Self {
            enable_local_tracer: true,
            enable_global_tracer: false,
            enable_metrics: true,
            service_name: String::new(),
            install_signal_handler: true,
            stdout: StdoutConfig::default(),
            file: FileConfig::default(),
            apmplus: BackendConfig::default(),
            cozeloop: BackendConfig::default(),
            tls: BackendConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl OpenTelemetryConfig {
    /// Remote backends with a non-empty endpoint, in a fixed order.
    pub fn enabled_backends(&self) -> Vec<(Backend, &BackendConfig)> {
        [
            (Backend::ApmPlus, &self.apmplus),
            (Backend::CozeLoop, &self.cozeloop),
            (Backend::Tls, &self.tls),
        ]
        .into_iter()
        .filter(|(_, backend)| backend.is_enabled())
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StdoutConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    ApmPlus,
    CozeLoop,
    Tls,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::ApmPlus => "apmplus",
            Backend::CozeLoop => "cozeloop",
            Backend::Tls => "tls",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
    pub api_key: String,
    pub service_name: String,
    pub protocol: Option<String>,
    pub region: Option<String>,
    pub topic_id: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    /// OTLP over HTTP when the protocol starts with `http`, gRPC otherwise.
    pub fn is_http(&self) -> bool {
        self.protocol
            .as_deref()
            .is_some_and(|protocol| protocol.trim().to_ascii_lowercase().starts_with("http"))
    }

    /// Authentication headers the backend expects on every export request.
    pub fn headers(&self, backend: Backend) -> Result<Vec<(&'static str, String)>> {
        let destination = backend.as_str();
        let required = |value: Option<&str>, field: &'static str| -> Result<String> {
            match value.map(str::trim) {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(TelemetryError::MissingCredential { destination, field }),
            }
        };

        match backend {
            Backend::ApmPlus => {
                Ok(vec![("x-byteapm-appkey", required(Some(&self.api_key), "api_key")?)])
            }
            Backend::CozeLoop => Ok(vec![
                ("authorization", format!("Bearer {}", required(Some(&self.api_key), "api_key")?)),
                ("cozeloop-workspace-id", required(Some(&self.service_name), "service_name")?),
            ]),
            Backend::Tls => Ok(vec![
                ("x-tls-otel-tracetopic", required(self.topic_id.as_deref(), "topic_id")?),
                ("x-tls-otel-ak", required(self.access_key.as_deref(), "access_key")?),
                ("x-tls-otel-sk", required(self.secret_key.as_deref(), "secret_key")?),
                ("x-tls-otel-region", required(self.region.as_deref(), "region")?),
            ]),
        }
    }
}

/// Span registry cleanup tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub cleanup_grace_period_secs: u64,
    pub cleanup_tick_secs: u64,
    pub cleanup_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { cleanup_grace_period_secs: 300, cleanup_tick_secs: 10, cleanup_queue_capacity: 1024 }
    }
}

impl RegistryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_period_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.cleanup_tick_secs.max(1))
    }
}
