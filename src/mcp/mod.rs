//! Model Context Protocol transport over stdio.

pub mod protocol;
pub mod server;

pub use server::McpServer;
