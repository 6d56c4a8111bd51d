use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use toolchat_core::tool::{Error as ToolError, ToolOutcome, ToolRegistry};
use toolchat_model::ToolDescriptor;

use crate::client::McpClient;
use crate::config::ServerConfig;
use crate::error::Result;

/// Exposes the tools of one MCP server as a [`ToolRegistry`].
///
/// The tool list is fetched once and reused for the lifetime of the
/// connection.
#[derive(Clone)]
pub struct McpRegistry {
    client: Arc<McpClient>,
    tools: Arc<OnceCell<Vec<ToolDescriptor>>>,
}

impl McpRegistry {
    /// Wraps a connected client.
    pub fn new(client: McpClient) -> Self {
        Self {
            client: Arc::new(client),
            tools: Arc::new(OnceCell::new()),
        }
    }

    /// Connects to `config` and wraps the session.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        Ok(Self::new(McpClient::connect(config).await?))
    }

    /// Returns the underlying client.
    #[inline]
    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Closes the connection. Later calls fail with a transport error.
    pub async fn close(&self) {
        self.client.close().await;
    }
}

#[async_trait]
impl ToolRegistry for McpRegistry {
    async fn list_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, ToolError> {
        let tools = self
            .tools
            .get_or_try_init(|| async {
                let definitions = self.client.list_tools().await?;
                Ok::<_, ToolError>(
                    definitions
                        .into_iter()
                        .map(|tool| ToolDescriptor {
                            name: tool.name,
                            description: tool.description,
                            input_schema: tool.input_schema,
                        })
                        .collect(),
                )
            })
            .await?;
        Ok(tools.clone())
    }

    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolOutcome {
        let result = self.client.call_tool(name, arguments).await?;
        let content = result.render();
        if result.is_error {
            debug!("`{name}` on `{}` reported an error", self.client.name());
            return Err(ToolError::execution_error().with_reason(content));
        }
        Ok(content)
    }
}

impl Debug for McpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpRegistry")
            .field("client", &self.client)
            .field("tools", &self.tools.get().map(Vec::len))
            .finish()
    }
}
