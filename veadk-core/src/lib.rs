//! # veadk-core
//!
//! Host-framework types consumed by the VeADK crates.
//!
//! ## Overview
//!
//! - [`Content`] / [`Part`] - Message payloads exchanged with models and tools
//! - [`LlmRequest`] / [`LlmResponse`] - Model call request and (possibly partial) response
//! - [`ReadonlyContext`], [`CallbackContext`], [`InvocationContext`], [`ToolContext`] -
//!   What a lifecycle callback can see about the scope it runs in
//! - [`TempState`] - Invocation-scoped scratch storage shared by callbacks
//! - [`VeAdkError`] / [`Result`] - Unified error handling

pub mod context;
pub mod error;
pub mod model;
pub mod state;
pub mod tool;
pub mod types;

pub use context::{CallbackContext, InvocationContext, ReadonlyContext, RunConfig, StreamingMode};
pub use error::{Result, VeAdkError};
pub use model::{FinishReason, GenerateContentConfig, LlmRequest, LlmResponse, UsageMetadata};
pub use state::TempState;
pub use tool::ToolContext;
pub use types::{Content, FunctionResponseData, Part};
