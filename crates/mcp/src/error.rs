use std::time::Duration;

use thiserror::Error;
use toolchat_core::tool::Error as ToolError;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from talking to an MCP server.
#[derive(Error, Debug)]
pub enum Error {
    /// The server command could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The program that was run.
        command: String,
        /// Why spawning failed.
        source: std::io::Error,
    },

    /// An HTTP request to the server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a JSON-RPC error.
    #[error("server error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Message from the server.
        message: String,
    },

    /// No response arrived in time.
    #[error("`{method}` timed out after {timeout:?}")]
    Timeout {
        /// The method that was called.
        method: String,
        /// The limit that elapsed.
        timeout: Duration,
    },

    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// The server broke the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A server target could not be understood.
    #[error("invalid server target `{0}`")]
    InvalidTarget(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        let base = match &err {
            Error::Timeout { .. } => ToolError::timeout(),
            Error::Rpc { .. } => ToolError::execution_error(),
            Error::Json(_) | Error::Protocol(_) => ToolError::execution_error(),
            _ => ToolError::transport(),
        };
        base.with_reason(err.to_string())
    }
}
