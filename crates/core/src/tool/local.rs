use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use toolchat_model::ToolDescriptor;

use super::object::{ToolObject, ToolObjectImpl};
use super::{Error, Tool, ToolOutcome, ToolRegistry};

/// A registry of tools that run inside this process.
///
/// Tools are listed in registration order. Registering a tool with a name
/// that is already taken replaces the earlier one.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn ToolObject>>,
}

impl LocalRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    pub fn add_tool<T: Tool>(&mut self, tool: T) {
        let name = tool.name().to_owned();
        if self
            .tools
            .insert(name.clone(), Arc::new(ToolObjectImpl(tool)))
            .is_some()
        {
            warn!("tool `{name}` registered twice, keeping the last one");
        } else {
            self.order.push(name);
        }
    }

    /// Registers a tool, builder style.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.add_tool(tool);
        self
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn definitions(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDescriptor {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                input_schema: tool.parameter_schema().clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ToolRegistry for LocalRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        Ok(self.definitions())
    }

    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            warn!("tool not found: {name}");
            return Err(Error::not_found(name));
        };
        trace!("running tool `{name}` with args: {arguments:?}");
        Arc::clone(tool).execute(Value::Object(arguments)).await
    }
}

impl Debug for LocalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("tools", &self.order)
            .finish()
    }
}
