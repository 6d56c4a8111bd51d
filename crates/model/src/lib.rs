//! Provider-neutral types for talking to completion endpoints.
//!
//! The chat loop only ever sees the types in this crate: a conversation is a
//! list of [`ModelMessage`]s, the tools offered to the model are
//! [`ToolDescriptor`]s, and a provider answers a [`ModelRequest`] with a
//! stream of [`ModelResponseEvent`]s. Concrete providers (OpenAI, the test
//! script, ...) live in their own crates and translate these types to and
//! from their wire formats.
//!
//! Nothing here performs I/O.

#![deny(missing_docs)]

mod error;
mod message;
mod provider;
mod request;
mod response;

pub use error::*;
pub use message::*;
pub use provider::*;
pub use request::*;
pub use response::*;
