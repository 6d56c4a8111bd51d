use toolchat_core::tool::{Error as ToolError, ToolOutcome};
use toolchat_core::{
    Agent, AgentBuilder, ChatError, Conversation, TurnOptions, TurnOutcome,
};
use toolchat_mcp::{McpRegistry, ServerConfig};
use toolchat_model::{ModelProvider, ToolCall, ToolDescriptor};

use crate::tools::CurrentTimeTool;

/// The system prompt used unless another one is set.
pub const DEFAULT_SYSTEM_PROMPT: &str = "you are a helpful assistant.";

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    agent_builder: AgentBuilder,
    system_prompt: Option<String>,
    servers: Vec<(Option<String>, ServerConfig)>,
    builtin_tools: bool,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        Self {
            agent_builder: AgentBuilder::with_model_provider(provider),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_owned()),
            servers: vec![],
            builtin_tools: true,
        }
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Starts conversations without a system prompt.
    #[inline]
    pub fn without_system_prompt(mut self) -> Self {
        self.system_prompt = None;
        self
    }

    /// Adds an MCP server whose tools keep their names.
    #[inline]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push((None, server));
        self
    }

    /// Adds an MCP server whose tools are exposed as `{prefix}_{name}`.
    #[inline]
    pub fn mount_server<S: Into<String>>(
        mut self,
        prefix: S,
        server: ServerConfig,
    ) -> Self {
        self.servers.push((Some(prefix.into()), server));
        self
    }

    /// Enables or disables the in-process tools, enabled by default.
    #[inline]
    pub fn with_builtin_tools(mut self, enabled: bool) -> Self {
        self.builtin_tools = enabled;
        self
    }

    /// Replaces the turn options.
    #[inline]
    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.agent_builder = self.agent_builder.with_options(options);
        self
    }

    /// Attaches a callback to be invoked when a transcript delta arrives.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_transcript(on_transcript);
        self
    }

    /// Attaches a callback to be invoked when a tool call finishes.
    #[inline]
    pub fn on_tool_result(
        mut self,
        on_tool_result: impl Fn(&ToolCall, &ToolOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_tool_result(on_tool_result);
        self
    }

    /// Connects to every server and builds a new session.
    ///
    /// Servers are connected in the order they were added. If one fails,
    /// the connections already made are closed again.
    pub async fn build(self) -> Result<Session, toolchat_mcp::Error> {
        let Self {
            mut agent_builder,
            system_prompt,
            servers: configs,
            builtin_tools,
        } = self;

        let mut servers = Vec::with_capacity(configs.len());
        for (prefix, config) in configs {
            match McpRegistry::connect(&config).await {
                Ok(registry) => servers.push((prefix, registry)),
                Err(err) => {
                    error!("cannot connect to `{}`: {err}", config.name);
                    for (_, registry) in &servers {
                        registry.close().await;
                    }
                    return Err(err);
                }
            }
            info!("connected to `{}`", config.name);
        }

        if let Some(prompt) = system_prompt {
            agent_builder = agent_builder.with_system_prompt(prompt);
        }
        if builtin_tools {
            agent_builder = agent_builder.with_tool(CurrentTimeTool::new());
        }
        for (prefix, registry) in &servers {
            agent_builder = match prefix {
                Some(prefix) => {
                    agent_builder.mount_registry(prefix.clone(), registry.clone())
                }
                None => agent_builder.with_registry(registry.clone()),
            };
        }

        Ok(Session {
            agent: agent_builder.build(),
            servers: servers.into_iter().map(|(_, registry)| registry).collect(),
        })
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session holds a fully configured agent and the MCP connections its
/// tools come from. It is basically a wrapper around [`Agent`].
pub struct Session {
    agent: Agent,
    servers: Vec<McpRegistry>,
}

impl Session {
    /// Sends a message to the session and waits for the answer.
    #[inline]
    pub async fn send_message(
        &mut self,
        message: &str,
    ) -> Result<TurnOutcome, ChatError> {
        self.agent.send_message(message).await
    }

    /// Lists the tools the model is offered.
    #[inline]
    pub async fn tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        self.agent.tools().await
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        self.agent.conversation()
    }

    /// Returns the connected MCP servers.
    #[inline]
    pub fn servers(&self) -> &[McpRegistry] {
        &self.servers
    }

    /// Starts over, keeping the system prompt.
    #[inline]
    pub fn reset(&mut self) {
        self.agent.reset();
    }

    /// Closes every MCP connection.
    pub async fn close(self) {
        for server in &self.servers {
            server.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;
    use toolchat_model::ModelMessage;
    use toolchat_test_model::{PresetResponse, TestModelProvider};

    use super::*;

    #[tokio::test]
    async fn test_current_time_round() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::tool_calls([(
            "call_0",
            "get_current_time",
            json!({ "timezone": "Asia/Tokyo" }),
        )]));
        provider.add_response(PresetResponse::text("It is evening in Tokyo."));

        let mut session = SessionBuilder::with_model_provider(provider.clone())
            .without_system_prompt()
            .build()
            .await
            .unwrap();
        let outcome = session
            .send_message("What time is it in Tokyo?")
            .await
            .unwrap();
        assert_eq!(outcome.answer(), Some("It is evening in Tokyo."));

        let messages = session.conversation().messages();
        assert_eq!(messages.len(), 4);
        let ModelMessage::Tool(result) = &messages[2] else {
            panic!("expected a tool result");
        };
        assert_eq!(result.tool_call_id, "call_0");
        let now = DateTime::parse_from_rfc3339(&result.content).unwrap();
        assert_eq!(now.offset().local_minus_utc(), 9 * 3600);

        let tools = &provider.requests()[0].tools;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_current_time");
    }

    #[tokio::test]
    async fn test_default_system_prompt() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text("Hello!"));

        let mut session = SessionBuilder::with_model_provider(provider.clone())
            .with_builtin_tools(false)
            .build()
            .await
            .unwrap();
        assert!(session.tools().await.unwrap().is_empty());
        session.send_message("Hi").await.unwrap();
        assert_eq!(
            session.conversation().messages()[0],
            ModelMessage::system(DEFAULT_SYSTEM_PROMPT)
        );
        assert!(provider.requests()[0].tools.is_empty());

        session.reset();
        assert_eq!(session.conversation().len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let provider = TestModelProvider::default();
        let server = ServerConfig::stdio(
            "missing",
            "/nonexistent/toolchat-server",
            vec![],
        );
        let result = SessionBuilder::with_model_provider(provider)
            .with_server(server)
            .build()
            .await;
        assert!(matches!(result, Err(toolchat_mcp::Error::Spawn { .. })));
    }
}
