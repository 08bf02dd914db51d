//! # veadk-plugin
//!
//! Plugin system for VeADK agents.
//!
//! Plugins hook into the lifecycle points a host drives:
//! - **Run lifecycle**: Before/after the whole invocation
//! - **Agent callbacks**: Before/after one agent's turn
//! - **Model callbacks**: Before/after each LLM call, once per streamed chunk
//! - **Tool callbacks**: Before/after tool execution, plus error hooks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use veadk_plugin::{Plugin, PluginManager};
//!
//! let manager = PluginManager::new(vec![Arc::new(MyPlugin) as Arc<dyn Plugin>]);
//! manager.run_before_run(ctx.clone()).await?;
//! ```

mod manager;
mod plugin;

pub use manager::{PluginManager, PluginManagerConfig};
pub use plugin::Plugin;
