//! A terminal chat client that lets a language model call tools served by
//! MCP servers.
//!
//! The crate includes a CLI tool for using in the terminal. And you can also
//! use it as a library to bring the same session into your own host apps.

#![deny(missing_docs)]

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

pub mod config;
mod session;
pub mod tools;

pub use session::{DEFAULT_SYSTEM_PROMPT, Session, SessionBuilder};

/// Re-exports of [`toolchat_core`] crate.
pub mod core {
    pub use toolchat_core::*;
}

/// Re-exports of [`toolchat_mcp`] crate.
pub mod mcp {
    pub use toolchat_mcp::*;
}
