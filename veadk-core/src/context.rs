use crate::state::TempState;
use crate::types::Content;
use opentelemetry::trace::SpanContext;

pub trait ReadonlyContext: Send + Sync {
    fn invocation_id(&self) -> &str;
    fn agent_name(&self) -> &str;
    fn user_id(&self) -> &str;
    fn app_name(&self) -> &str;
    fn session_id(&self) -> &str;
    fn branch(&self) -> &str;
    fn user_content(&self) -> &Content;

    /// The span the host itself opened for the current scope, when the host is
    /// tracing-instrumented. Only identifiers are exposed, never the span object.
    fn host_span(&self) -> Option<SpanContext> {
        None
    }
}

pub trait CallbackContext: ReadonlyContext {
    /// Ephemeral state shared by every callback of the current invocation.
    fn temp_state(&self) -> &TempState;
}

pub trait InvocationContext: CallbackContext {
    fn run_config(&self) -> &RunConfig;
    fn end_invocation(&self);
    fn ended(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    None,
    SSE,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub streaming_mode: StreamingMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { streaming_mode: StreamingMode::None }
    }
}

impl RunConfig {
    pub fn is_streaming(&self) -> bool {
        self.streaming_mode == StreamingMode::SSE
    }
}
