use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ModelMessage;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelRequest {
    /// The conversation so far.
    pub messages: Vec<ModelMessage>,
    /// Tools that are available to the model.
    pub tools: Vec<ToolDescriptor>,
}

/// Describes a tool that can be offered to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Name of the tool, unique within one registry listing.
    pub name: String,
    /// What the tool does, written for the model.
    #[serde(default)]
    pub description: String,
    /// A [JSON schema](https://json-schema.org/) for the arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}
