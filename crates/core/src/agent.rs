mod builder;

use std::fmt::{self, Debug};
use std::sync::Arc;

use toolchat_model::ToolDescriptor;

use crate::chat::{ChatError, TurnObserver, TurnOptions, TurnOutcome, run_turn_observed};
use crate::conversation::Conversation;
use crate::model_client::ModelClient;
use crate::tool::{Error as ToolError, ToolRegistry};
pub use builder::AgentBuilder;

/// A chat session: a model, the tools it may call and the conversation so
/// far.
///
/// The agent owns its conversation exclusively. Every method that changes
/// it takes `&mut self`, so one turn is processed at a time and no locking
/// is involved.
pub struct Agent {
    client: ModelClient,
    registry: Arc<dyn ToolRegistry>,
    conversation: Conversation,
    options: TurnOptions,
    observer: TurnObserver,
}

impl Agent {
    /// Appends a user message and runs the chat loop until the model
    /// answers or a budget runs out.
    ///
    /// On error, the user message and the iterations that completed before
    /// the failure stay in the conversation.
    pub async fn send_message<S: Into<String>>(
        &mut self,
        message: S,
    ) -> Result<TurnOutcome, ChatError> {
        self.conversation.push_user(message);
        run_turn_observed(
            &mut self.conversation,
            self.registry.as_ref(),
            &self.client,
            &self.options,
            &self.observer,
        )
        .await
    }

    /// Lists the tools the model is offered.
    #[inline]
    pub async fn tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        self.registry.list_tools().await
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Returns the options used for every turn.
    #[inline]
    pub fn options(&self) -> &TurnOptions {
        &self.options
    }

    /// Replaces the options used for later turns.
    #[inline]
    pub fn set_options(&mut self, options: TurnOptions) {
        self.options = options;
    }

    /// Forgets everything but the system prompt.
    #[inline]
    pub fn reset(&mut self) {
        self.conversation.clear();
    }
}

impl Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("conversation_len", &self.conversation.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
