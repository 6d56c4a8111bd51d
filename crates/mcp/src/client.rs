use std::fmt::{self, Debug};
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::config::{McpTransport, ServerConfig};
use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeResult,
    ListToolsResult, MCP_PROTOCOL_VERSION, McpToolDefinition, initialize_params,
};
use crate::transport::{Connection, connect_sse, connect_stdio};

// Guards against servers that keep handing out cursors.
const MAX_LIST_PAGES: usize = 100;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Connected and initialized.
    Connected,
    /// Closed by the client, or the server went away.
    Closed,
}

/// A connected, initialized MCP session.
pub struct McpClient {
    name: String,
    connection: Connection,
    request_timeout: Duration,
    server_info: Option<Implementation>,
}

impl McpClient {
    /// Connects to the server and performs the `initialize` handshake.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let connection = match &config.transport {
            McpTransport::Stdio { command, args, env } => {
                connect_stdio(&config.name, command, args, env)?
            }
            McpTransport::Sse { url } => {
                connect_sse(&config.name, url, config.connection_timeout).await?
            }
        };

        let client_info = Implementation {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let result = connection
            .request(
                "initialize",
                Some(initialize_params(&client_info)),
                config.connection_timeout,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)?;
        if result.protocol_version != MCP_PROTOCOL_VERSION {
            warn!(
                "server `{}` speaks protocol {}, continuing anyway",
                config.name, result.protocol_version
            );
        }
        connection.notify("notifications/initialized")?;

        match &result.server_info {
            Some(info) => info!(
                "connected to `{}` ({} {})",
                config.name, info.name, info.version
            ),
            None => info!("connected to `{}`", config.name),
        }
        Ok(Self {
            name: config.name.clone(),
            connection,
            request_timeout: config.request_timeout,
            server_info: result.server_info,
        })
    }

    /// Returns the configured server name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns what the server said about itself.
    #[inline]
    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    /// Returns whether the connection is still usable.
    #[inline]
    pub fn state(&self) -> McpClientState {
        if self.connection.is_closed() {
            McpClientState::Closed
        } else {
            McpClientState::Connected
        }
    }

    /// Lists every tool, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        let mut tools = vec![];
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
            let page = self
                .connection
                .request("tools/list", params, self.request_timeout)
                .await?;
            let page: ListToolsResult = serde_json::from_value(page)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    debug!("`{}` offers {} tools", self.name, tools.len());
                    return Ok(tools);
                }
            }
        }
        Err(Error::Protocol(format!(
            "tool listing did not end after {MAX_LIST_PAGES} pages"
        )))
    }

    /// Calls a tool.
    ///
    /// A tool that reports failure still yields `Ok`, with
    /// [`CallToolResult::is_error`] set.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult> {
        debug!("calling `{name}` on `{}`", self.name);
        let params = serde_json::to_value(CallToolParams {
            name: name.to_owned(),
            arguments,
        })?;
        let result = self
            .connection
            .request("tools/call", Some(params), self.request_timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Closes the session and stops the server process, if there is one.
    pub async fn close(&self) {
        info!("closing `{}`", self.name);
        self.connection.shutdown().await;
    }
}

impl Debug for McpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("server_info", &self.server_info)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
