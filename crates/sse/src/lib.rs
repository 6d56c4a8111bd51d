//! Server-sent events over a chunked HTTP body.
//!
//! Both the completion provider and the MCP SSE transport read event
//! streams; this crate holds the one parser they share.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod chunks;
mod sse;

pub use chunks::{Chunks, Error as ChunksError};
pub use sse::{Error, Sse, SseEvent};
