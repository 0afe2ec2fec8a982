//! Distribution feeder analysis exposed as remotely callable tools.
//!
//! A [`session::Session`] owns the circuit engine and the most recent analysis
//! results. Tool calls are routed through [`tools::call_tool`], which always
//! answers with a [`tools::ToolResponse`] envelope, and the `mcp` and `api`
//! modules carry those calls over stdio and HTTP.

#[cfg(feature = "http")]
pub mod api;
pub mod config;
pub mod engine;
pub mod mcp;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod viz;

pub use session::Session;
pub use tools::{call_tool, ToolName, ToolResponse};
