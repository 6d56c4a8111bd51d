use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ModelMessage {
    /// The system instructions.
    System {
        /// Instruction text.
        content: String,
    },
    /// A user input text.
    User {
        /// What the user said.
        content: String,
    },
    /// A message produced by the model.
    ///
    /// `tool_calls` is empty for a plain answer. When it is not empty,
    /// the message must be followed by exactly one [`ModelMessage::Tool`]
    /// per call before the next assistant message.
    Assistant {
        /// Text the model produced alongside (or instead of) tool calls.
        content: String,
        /// Tools the model asked for, in the order it asked.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// The result of one tool call.
    Tool(ToolResult),
}

impl ModelMessage {
    /// Creates a system message.
    #[inline]
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[inline]
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Creates an assistant message without tool calls.
    #[inline]
    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: vec![],
        }
    }

    /// Returns the tool calls carried by this message, if any.
    #[inline]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Returns the text of this message.
    ///
    /// For tool messages this is the tool output.
    pub fn text(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. } => content,
            Self::Tool(result) => &result.content,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier of the call, unique within one assistant message.
    pub id: String,
    /// The name of the tool to call.
    pub name: String,
    /// Named arguments for the tool.
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Creates a tool call.
    ///
    /// Non-object `arguments` are treated as no arguments.
    pub fn new<I: Into<String>, N: Into<String>>(
        id: I,
        name: N,
        arguments: Value,
    ) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of one tool call, as it is shown to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The id of the [`ToolCall`] this result answers.
    pub tool_call_id: String,
    /// Output of the tool, or a description of what went wrong.
    pub content: String,
}
