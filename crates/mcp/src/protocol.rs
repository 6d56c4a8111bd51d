//! JSON-RPC 2.0 envelopes and the MCP payloads this client uses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

/// MCP protocol version sent in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// MCP JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Creates a request without parameters.
    pub fn new(id: u64, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params: None,
        }
    }

    /// Adds parameters.
    pub fn with_params(mut self, params: impl Into<Value>) -> Self {
        self.params = Some(params.into());
        self
    }
}

/// MCP JSON-RPC response.
///
/// The id is kept as a raw value, servers may echo ids of any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Request ID this responds to.
    pub id: Value,
    /// Result (on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    /// Creates a successful response.
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(McpError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Turns the response into its result, or the server's error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(Error::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// MCP JSON-RPC error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    /// Error code.
    pub code: i64,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP JSON-RPC notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpNotification {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    /// Creates a notification without parameters.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params: None,
        }
    }
}

/// A message read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// The server asks the client for something.
    Request {
        /// Id to answer with.
        id: Value,
        /// Requested method.
        method: String,
    },
    /// A one-way message.
    Notification(McpNotification),
    /// The answer to one of our requests.
    Response(McpResponse),
}

impl Incoming {
    /// Classifies one JSON-RPC message.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Some(object) = value.as_object() else {
            return Err(Error::Protocol(format!("not a JSON-RPC message: {text}")));
        };
        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        match (object.get("method").and_then(Value::as_str), has_id) {
            (Some(method), true) => Ok(Incoming::Request {
                id: object["id"].clone(),
                method: method.to_owned(),
            }),
            (Some(_), false) => Ok(Incoming::Notification(serde_json::from_value(value)?)),
            (None, true) => Ok(Incoming::Response(serde_json::from_value(value)?)),
            (None, false) => Err(Error::Protocol(format!(
                "message has neither method nor id: {text}"
            ))),
        }
    }
}

/// Name and version of a client or server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Program name.
    pub name: String,
    /// Program version.
    #[serde(default)]
    pub version: String,
}

/// Builds the `initialize` parameters.
pub fn initialize_params(client: &Implementation) -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": client,
    })
}

/// The server's answer to `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Version the server agreed on.
    pub protocol_version: String,
    /// Server capabilities, kept opaque.
    #[serde(default)]
    pub capabilities: Value,
    /// Who the server is.
    pub server_info: Option<Implementation>,
}

/// MCP tool definition from server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// Input schema (JSON Schema).
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// Tools on this page.
    pub tools: Vec<McpToolDefinition>,
    /// Cursor of the next page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool to run.
    pub name: String,
    /// Arguments for the tool.
    pub arguments: Map<String, Value>,
}

/// The result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content blocks, `{"type": "text", "text": ...}` being the common one.
    #[serde(default)]
    pub content: Vec<Value>,
    /// Set when the tool itself failed.
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Renders the content as one string: text blocks as their text,
    /// anything else as JSON, one block per line.
    pub fn render(&self) -> String {
        self.content
            .iter()
            .map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
