use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default MCP connection timeout.
pub const MCP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default MCP request timeout.
pub const MCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP transport type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    /// Spawn a subprocess and talk over its stdin and stdout.
    Stdio {
        /// Command to run.
        command: String,
        /// Command arguments.
        args: Vec<String>,
        /// Extra environment variables for the process.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// HTTP with server-sent events.
    Sse {
        /// URL of the event stream.
        url: String,
    },
}

/// How to reach one MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, used in logs and as the default tool prefix.
    pub name: String,
    /// How to connect.
    pub transport: McpTransport,
    /// Limit for connecting and the `initialize` handshake.
    pub connection_timeout: Duration,
    /// Limit for every later request.
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// Creates configuration for a stdio-based MCP server.
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self::with_transport(
            name,
            McpTransport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        )
    }

    /// Creates configuration for an SSE-based MCP server.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(name, McpTransport::Sse { url: url.into() })
    }

    fn with_transport(name: impl Into<String>, transport: McpTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            connection_timeout: MCP_CONNECTION_TIMEOUT,
            request_timeout: MCP_REQUEST_TIMEOUT,
        }
    }

    /// Interprets a command-line target.
    ///
    /// - `http://…` or `https://…` connects over SSE;
    /// - a path ending in `.py` runs `python <path>`;
    /// - anything else is split on whitespace into a command line.
    pub fn from_target(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.starts_with("http://") || target.starts_with("https://") {
            let name = target
                .split("://")
                .nth(1)
                .and_then(|rest| rest.split(['/', ':']).next())
                .filter(|host| !host.is_empty())
                .ok_or_else(|| Error::InvalidTarget(target.to_owned()))?;
            return Ok(Self::sse(name, target));
        }

        if target.ends_with(".py") {
            return Ok(Self::stdio(
                file_stem(target),
                "python",
                vec![target.to_owned()],
            ));
        }

        let mut parts = target.split_whitespace();
        let Some(command) = parts.next() else {
            return Err(Error::InvalidTarget(target.to_owned()));
        };
        let args: Vec<String> = parts.map(str::to_owned).collect();
        let name = args
            .last()
            .map(|arg| file_stem(arg))
            .unwrap_or_else(|| file_stem(command));
        Ok(Self::stdio(name, command, args))
    }

    /// Renames the server.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds an environment variable for stdio servers.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let McpTransport::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Sets the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(path)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_target() {
        let config = ServerConfig::from_target("servers/time_server.py").unwrap();
        assert_eq!(config.name, "time_server");
        assert_eq!(
            config.transport,
            McpTransport::Stdio {
                command: "python".to_owned(),
                args: vec!["servers/time_server.py".to_owned()],
                env: HashMap::new(),
            }
        );
        assert_eq!(config.request_timeout, MCP_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_http_target() {
        let config = ServerConfig::from_target("http://localhost:8000/sse").unwrap();
        assert_eq!(config.name, "localhost");
        assert_eq!(
            config.transport,
            McpTransport::Sse {
                url: "http://localhost:8000/sse".to_owned()
            }
        );
    }

    #[test]
    fn test_command_target() {
        let config = ServerConfig::from_target("npx -y @acme/weather-server").unwrap();
        assert_eq!(config.name, "weather-server");
        let McpTransport::Stdio { command, args, .. } = config.transport else {
            panic!("expected stdio");
        };
        assert_eq!(command, "npx");
        assert_eq!(args, ["-y", "@acme/weather-server"]);

        let config = ServerConfig::from_target("/usr/local/bin/mcp-time").unwrap();
        assert_eq!(config.name, "mcp-time");
    }

    #[test]
    fn test_invalid_targets() {
        assert!(ServerConfig::from_target("   ").is_err());
        assert!(ServerConfig::from_target("http://").is_err());
    }
}
