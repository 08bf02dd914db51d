//! Plugin Manager
//!
//! Coordinates execution of callbacks across all registered plugins.

use crate::Plugin;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use veadk_core::{
    CallbackContext, Content, InvocationContext, LlmRequest, LlmResponse, Result, ToolContext,
};

/// Configuration for the PluginManager.
#[derive(Clone)]
pub struct PluginManagerConfig {
    /// Timeout for closing each plugin during shutdown.
    pub close_timeout: Duration,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self { close_timeout: Duration::from_secs(5) }
    }
}

/// Manages a collection of plugins and coordinates callback execution.
///
/// Callbacks run in registration order. For callbacks that can short-circuit
/// or replace a result, the first plugin to return `Some` wins and later
/// plugins are not consulted. The first error stops the chain and is returned.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    config: PluginManagerConfig,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins, config: PluginManagerConfig::default() }
    }

    pub fn with_config(plugins: Vec<Arc<dyn Plugin>>, config: PluginManagerConfig) -> Self {
        Self { plugins, config }
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run before_run callbacks. If any plugin returns content, the run should be skipped.
    pub async fn run_before_run(&self, ctx: Arc<dyn InvocationContext>) -> Result<Option<Content>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running before_run callback");
            match plugin.before_run(ctx.clone()).await {
                Ok(Some(content)) => {
                    debug!(plugin = plugin.name(), "before_run returned early exit content");
                    return Ok(Some(content));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "before_run callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Run after_run callbacks. This does not emit events, it is for cleanup and reporting.
    pub async fn run_after_run(&self, ctx: Arc<dyn InvocationContext>) {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running after_run callback");
            plugin.after_run(ctx.clone()).await;
        }
    }

    pub async fn run_before_agent(&self, ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running before_agent callback");
            match plugin.before_agent(ctx.clone()).await {
                Ok(Some(content)) => {
                    debug!(plugin = plugin.name(), "before_agent returned early exit content");
                    return Ok(Some(content));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "before_agent callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    pub async fn run_after_agent(&self, ctx: Arc<dyn CallbackContext>) -> Result<Option<Content>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running after_agent callback");
            match plugin.after_agent(ctx.clone()).await {
                Ok(Some(content)) => {
                    debug!(plugin = plugin.name(), "after_agent returned content");
                    return Ok(Some(content));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "after_agent callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Run before_model callbacks. A returned response replaces the model call.
    pub async fn run_before_model(
        &self,
        ctx: Arc<dyn CallbackContext>,
        request: &LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running before_model callback");
            match plugin.before_model(ctx.clone(), request).await {
                Ok(Some(response)) => {
                    debug!(plugin = plugin.name(), "before_model skipped model call");
                    return Ok(Some(response));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "before_model callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Run after_model callbacks for one response chunk.
    ///
    /// Every plugin observes the response as modified by the plugins before it.
    pub async fn run_after_model(
        &self,
        ctx: Arc<dyn CallbackContext>,
        response: LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        let mut current_response = response;
        let mut was_modified = false;

        for plugin in &self.plugins {
            debug!(
                plugin = plugin.name(),
                partial = current_response.partial,
                "Running after_model callback"
            );
            match plugin.after_model(ctx.clone(), &current_response).await {
                Ok(Some(modified)) => {
                    was_modified = true;
                    current_response = modified;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "after_model callback failed");
                    return Err(e);
                }
            }
        }

        Ok(was_modified.then_some(current_response))
    }

    pub async fn run_on_model_error(
        &self,
        ctx: Arc<dyn CallbackContext>,
        request: &LlmRequest,
        error: &str,
    ) -> Result<Option<LlmResponse>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "Running on_model_error callback");
            match plugin.on_model_error(ctx.clone(), request, error).await {
                Ok(Some(response)) => {
                    debug!(plugin = plugin.name(), "on_model_error provided fallback response");
                    return Ok(Some(response));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "on_model_error callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    pub async fn run_before_tool(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        args: &Value,
    ) -> Result<Option<Value>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), tool = tool_name, "Running before_tool callback");
            match plugin.before_tool(ctx.clone(), tool_name, args).await {
                Ok(Some(result)) => {
                    debug!(plugin = plugin.name(), "before_tool returned early exit result");
                    return Ok(Some(result));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "before_tool callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    pub async fn run_after_tool(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        args: &Value,
        result: &Value,
    ) -> Result<Option<Value>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), tool = tool_name, "Running after_tool callback");
            match plugin.after_tool(ctx.clone(), tool_name, args, result).await {
                Ok(Some(replaced)) => {
                    debug!(plugin = plugin.name(), "after_tool returned result");
                    return Ok(Some(replaced));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "after_tool callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    pub async fn run_on_tool_error(
        &self,
        ctx: Arc<dyn ToolContext>,
        tool_name: &str,
        args: &Value,
        error: &str,
    ) -> Result<Option<Value>> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), tool = tool_name, "Running on_tool_error callback");
            match plugin.on_tool_error(ctx.clone(), tool_name, args, error).await {
                Ok(Some(result)) => {
                    debug!(plugin = plugin.name(), "on_tool_error provided fallback result");
                    return Ok(Some(result));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "on_tool_error callback failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Close all plugins, each bounded by the configured timeout.
    pub async fn close(&self) {
        debug!("Closing {} plugins", self.plugins.len());

        for plugin in &self.plugins {
            match tokio::time::timeout(self.config.close_timeout, plugin.close()).await {
                Ok(()) => {
                    debug!(plugin = plugin.name(), "Plugin closed successfully");
                }
                Err(_) => {
                    warn!(plugin = plugin.name(), "Plugin close timed out");
                }
            }
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_count", &self.plugins.len())
            .field("plugin_names", &self.plugin_names())
            .field("close_timeout", &self.config.close_timeout)
            .finish()
    }
}
