use opentelemetry::trace::TraceError;

use crate::scope::ScopePhase;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// No destination is enabled. Observability runs in no-op mode.
    #[error("no exporters configured")]
    NoExporters,

    /// Both the local and the global tracer are disabled.
    #[error("neither the local nor the global tracer is enabled")]
    NoTracer,

    #[error("invalid endpoint for {destination}: {endpoint}")]
    InvalidEndpoint { destination: &'static str, endpoint: String },

    #[error("missing credential for {destination}: {field}")]
    MissingCredential { destination: &'static str, field: &'static str },

    #[error("failed to build {destination} exporter: {reason}")]
    Exporter { destination: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid {scope} scope transition: {from:?} -> {to:?}")]
    InvalidTransition { scope: &'static str, from: ScopePhase, to: ScopePhase },
}

impl TelemetryError {
    /// Recoverable errors leave the process running with observability in a
    /// degraded, no-op mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TelemetryError::NoExporters
                | TelemetryError::NoTracer
                | TelemetryError::InvalidTransition { .. }
        )
    }
}

/// Every child failure of a fan-out call, joined into one error.
#[derive(Debug, thiserror::Error)]
#[error("{} of {total} exporters failed: {}", .failures.len(), .failures.join("; "))]
pub struct ExportErrors {
    pub failures: Vec<String>,
    pub total: usize,
}

impl ExportErrors {
    pub fn new(total: usize) -> Self {
        Self { failures: Vec::new(), total }
    }

    pub fn push(&mut self, destination: &str, error: impl std::fmt::Display) {
        self.failures.push(format!("{destination}: {error}"));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the joined error.
    pub fn into_result(self) -> Result<(), ExportErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<ExportErrors> for TraceError {
    fn from(errors: ExportErrors) -> Self {
        TraceError::Other(Box::new(errors))
    }
}

pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_exporters_is_recoverable() {
        assert!(TelemetryError::NoExporters.is_recoverable());
        let hard = TelemetryError::InvalidEndpoint { destination: "apmplus", endpoint: "x".into() };
        assert!(!hard.is_recoverable());
    }

    #[test]
    fn test_export_errors_join() {
        let mut errors = ExportErrors::new(3);
        errors.push("file", "disk full");
        errors.push("cozeloop", "unauthorized");
        let message = errors.to_string();
        assert_eq!(message, "2 of 3 exporters failed: file: disk full; cozeloop: unauthorized");
    }

    #[test]
    fn test_export_errors_empty_is_ok() {
        assert!(ExportErrors::new(2).into_result().is_ok());
    }
}
