//! A client for tool servers speaking the Model Context Protocol.
//!
//! Servers are reached over stdio (a spawned subprocess) or the HTTP+SSE
//! transport. [`McpRegistry`] plugs a connected server into the chat loop
//! as a tool registry.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod client;
mod config;
mod error;
pub mod protocol;
mod registry;
mod transport;

pub use client::{McpClient, McpClientState};
pub use config::{MCP_CONNECTION_TIMEOUT, MCP_REQUEST_TIMEOUT, McpTransport, ServerConfig};
pub use error::{Error, Result};
pub use registry::McpRegistry;
