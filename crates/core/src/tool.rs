//! Tool call supports.
//!
//! Tools reach the chat loop through the [`ToolRegistry`] trait. The
//! registries in this module cover in-process tools ([`LocalRegistry`])
//! and merging several registries under one name space
//! ([`CompositeRegistry`]); remote servers implement the trait in their own
//! crates.

mod composite;
mod error;
mod local;
mod object;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use toolchat_model::ToolDescriptor;

pub use composite::CompositeRegistry;
pub use error::{Error, ErrorKind};
pub use local::LocalRegistry;

/// The outcome of a tool call: the text shown to the model, or an error.
pub type ToolOutcome = Result<String, Error>;

/// A tool that can be called by the model.
///
/// Implementations of this trait should be stateless, and may not maintain any
/// internal state.
///
/// The tool can be context-aware, meaning it can access additional information
/// about the current execution context, such as the working directory or the
/// current user. To do this, make the context an immutable state of the tool,
/// which can be set during initialization, and copy it when executing.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned;

    /// Returns the name of the tool.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the parameter schema of the tool.
    fn parameter_schema(&self) -> &Value;

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`,
    /// and the future should be cancellation safe.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolOutcome> + Send + 'static;
}

/// A source of tools: lists what is available and runs a tool by name.
///
/// The listing is a snapshot. Registries backed by a connection return the
/// same tools for the lifetime of that connection.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Lists the tools this registry can invoke.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error>;

    /// Invokes the tool called `name`.
    ///
    /// Failures of the tool itself are returned as `Err`, they are never
    /// panics.
    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolOutcome;
}

#[async_trait]
impl<R: ToolRegistry + ?Sized> ToolRegistry for Arc<R> {
    #[inline]
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        (**self).list_tools().await
    }

    #[inline]
    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolOutcome {
        (**self).invoke(name, arguments).await
    }
}
