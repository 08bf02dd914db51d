//! Plugin definition
//!
//! A plugin bundles related lifecycle callbacks for one purpose (logging,
//! caching, observability). Every callback has a no-op default, so a plugin
//! only implements the hooks it cares about.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use veadk_core::{
    CallbackContext, Content, InvocationContext, LlmRequest, LlmResponse, Result, ToolContext,
};

/// Lifecycle hooks a host invokes around an invocation, an agent turn, a model
/// call and a tool call.
///
/// Returning `Ok(Some(..))` from a `before_*` hook short-circuits the step it
/// guards; from an `after_*` hook it replaces the step's result. `Ok(None)`
/// leaves the host's behaviour untouched.
///
/// # Example
///
/// ```rust,ignore
/// struct Audit;
///
/// #[async_trait]
/// impl Plugin for Audit {
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     async fn before_tool(
///         &self,
///         _ctx: Arc<dyn ToolContext>,
///         tool_name: &str,
///         _args: &Value,
///     ) -> Result<Option<Value>> {
///         tracing::info!(tool = tool_name, "tool requested");
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called before the run starts (can skip the run).
    async fn before_run(&self, _ctx: Arc<dyn InvocationContext>) -> Result<Option<Content>> {
        Ok(None)
    }

    /// Called after the run completes. Cleanup and reporting only.
    async fn after_run(&self, _ctx: Arc<dyn InvocationContext>) {}

    async fn before_agent(&self, _ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        Ok(None)
    }

    async fn after_agent(&self, _ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        Ok(None)
    }

    /// Called before the provider call. Returning a response skips the call.
    async fn before_model(
        &self,
        _ctx: Arc<dyn CallbackContext>,
        _request: &LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    /// Called once per response chunk, partial chunks included.
    async fn after_model(
        &self,
        _ctx: Arc<dyn CallbackContext>,
        _response: &LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    /// Called when the provider call fails. Returning a response recovers from the error.
    async fn on_model_error(
        &self,
        _ctx: Arc<dyn CallbackContext>,
        _request: &LlmRequest,
        _error: &str,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    async fn before_tool(
        &self,
        _ctx: Arc<dyn ToolContext>,
        _tool_name: &str,
        _args: &Value,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn after_tool(
        &self,
        _ctx: Arc<dyn ToolContext>,
        _tool_name: &str,
        _args: &Value,
        _result: &Value,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn on_tool_error(
        &self,
        _ctx: Arc<dyn ToolContext>,
        _tool_name: &str,
        _args: &Value,
        _error: &str,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Release anything the plugin holds. Called once when the manager closes.
    async fn close(&self) {}
}
