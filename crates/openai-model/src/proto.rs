use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolchat_model::{ModelMessage, ModelRequest, ToolCall as ModelToolCall, ToolDescriptor};

use crate::OpenAIConfig;

// ------------------------------
// Types received from the server
// ------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionToolCall>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChatCompletionChunk {
    // Azure sends content filter results first, with an empty id and no
    // choices.
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

// ------------------------
// Types sent to the server
// ------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct Tool {
    r#type: &'static str,
    function: FunctionTool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    max_tokens: u32,
    stream: bool,
}

// -----------
// Conversions
// -----------

#[inline]
pub fn create_request(
    req: &ModelRequest,
    config: &OpenAIConfig,
) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: config.model.clone(),
        messages: req.messages.iter().map(create_message).collect(),
        tools: req.tools.iter().map(create_tool).collect(),
        max_tokens: config.max_tokens,
        stream: true,
    }
}

fn create_message(msg: &ModelMessage) -> Message {
    match msg {
        ModelMessage::System { content } => Message::System {
            content: content.clone(),
        },
        ModelMessage::User { content } => Message::User {
            content: content.clone(),
        },
        ModelMessage::Assistant {
            content,
            tool_calls,
        } if tool_calls.is_empty() => Message::Assistant {
            content: Some(content.clone()),
            tool_calls: None,
        },
        ModelMessage::Assistant {
            content,
            tool_calls,
        } => Message::Assistant {
            content: (!content.is_empty()).then(|| content.clone()),
            tool_calls: Some(tool_calls.iter().map(create_tool_call).collect()),
        },
        ModelMessage::Tool(result) => Message::Tool {
            tool_call_id: result.tool_call_id.clone(),
            content: result.content.clone(),
        },
    }
}

fn create_tool_call(call: &ModelToolCall) -> ToolCall {
    ToolCall {
        index: None,
        id: Some(call.id.clone()),
        r#type: Some("function".to_owned()),
        function: Some(FunctionToolCall {
            name: Some(call.name.clone()),
            arguments: Some(Value::Object(call.arguments.clone()).to_string()),
        }),
    }
}

#[inline]
fn create_tool(tool: &ToolDescriptor) -> Tool {
    Tool {
        r#type: "function",
        function: FunctionTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}
