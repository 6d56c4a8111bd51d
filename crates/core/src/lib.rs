//! Core logic including the tool-calling chat loop, tool registries and
//! the agent session that ties them to a conversation.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod chat;
pub mod conversation;
mod model_client;
pub mod tool;

pub use agent::{Agent, AgentBuilder};
pub use chat::{
    BudgetExceeded, BudgetReason, ChatError, TurnObserver, TurnOptions,
    TurnOutcome, run_turn, run_turn_observed,
};
pub use conversation::Conversation;
pub use model_client::{Completion, ModelClient};
