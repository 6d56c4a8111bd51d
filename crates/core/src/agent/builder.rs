use std::sync::Arc;
use std::time::Duration;

use toolchat_model::{ModelProvider, ToolCall};

use super::Agent;
use crate::chat::{TurnObserver, TurnOptions};
use crate::conversation::Conversation;
use crate::model_client::ModelClient;
use crate::tool::{
    CompositeRegistry, LocalRegistry, Tool, ToolOutcome, ToolRegistry,
};

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    system_prompt: Option<String>,
    local: LocalRegistry,
    external: Vec<(Option<String>, Arc<dyn ToolRegistry>)>,
    options: TurnOptions,
    observer: TurnObserver,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            system_prompt: None,
            local: LocalRegistry::new(),
            external: vec![],
            options: TurnOptions::default(),
            observer: TurnObserver::default(),
        }
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Registers an in-process tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.local.add_tool(tool);
        self
    }

    /// Adds a registry whose tools keep their names.
    #[inline]
    pub fn with_registry<R: ToolRegistry + 'static>(
        mut self,
        registry: R,
    ) -> Self {
        let registry: Arc<dyn ToolRegistry> = Arc::new(registry);
        self.external.push((None, registry));
        self
    }

    /// Adds a registry whose tools are exposed as `{prefix}_{name}`.
    #[inline]
    pub fn mount_registry<S: Into<String>, R: ToolRegistry + 'static>(
        mut self,
        prefix: S,
        registry: R,
    ) -> Self {
        let registry: Arc<dyn ToolRegistry> = Arc::new(registry);
        self.external.push((Some(prefix.into()), registry));
        self
    }

    /// Replaces the turn options.
    #[inline]
    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    /// Caps the number of completions per turn. `None` removes the cap.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        self.options.max_iterations = max_iterations;
        self
    }

    /// Limits the wall-clock time of a turn.
    #[inline]
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.options.time_budget = Some(budget);
        self
    }

    /// Attaches a callback to be invoked when a transcript delta arrives.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.observer = self.observer.on_transcript(on_transcript);
        self
    }

    /// Attaches a callback to be invoked when a tool call finishes.
    #[inline]
    pub fn on_tool_result(
        mut self,
        on_tool_result: impl Fn(&ToolCall, &ToolOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.observer = self.observer.on_tool_result(on_tool_result);
        self
    }

    /// Builds the agent.
    ///
    /// In-process tools come first, so they shadow external tools with the
    /// same name.
    pub fn build(self) -> Agent {
        let Self {
            model_client,
            system_prompt,
            local,
            external,
            options,
            observer,
        } = self;

        let registry: Arc<dyn ToolRegistry> = if external.is_empty() {
            Arc::new(local)
        } else {
            let mut composite = CompositeRegistry::new();
            if !local.is_empty() {
                composite.add(local);
            }
            for (prefix, registry) in external {
                composite.add_shared(prefix, registry);
            }
            Arc::new(composite)
        };
        let conversation = match system_prompt {
            Some(prompt) => Conversation::with_system_prompt(prompt),
            None => Conversation::new(),
        };

        Agent {
            client: model_client,
            registry,
            conversation,
            options,
            observer,
        }
    }
}
