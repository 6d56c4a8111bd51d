//! Conversation-related types.

use std::collections::HashSet;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use toolchat_model::ModelMessage;

/// An ordered, append-only list of messages.
///
/// Messages produced by the chat loop are committed one whole iteration at
/// a time, so an interrupted iteration never leaves an assistant message
/// without its tool results.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ModelMessage>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation that starts with a system prompt.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(prompt: S) -> Self {
        Self {
            messages: vec![ModelMessage::system(prompt)],
        }
    }

    /// Appends a user message.
    #[inline]
    pub fn push_user<S: Into<String>>(&mut self, content: S) {
        self.messages.push(ModelMessage::user(content));
    }

    /// Returns all messages in order.
    #[inline]
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if there are no messages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the last message, if any.
    #[inline]
    pub fn last(&self) -> Option<&ModelMessage> {
        self.messages.last()
    }

    /// Drops everything except a leading system prompt.
    pub fn clear(&mut self) {
        let keep = matches!(self.messages.first(), Some(ModelMessage::System { .. }));
        self.messages.truncate(usize::from(keep));
    }

    #[inline]
    pub(crate) fn push(&mut self, msg: ModelMessage) {
        self.messages.push(msg);
    }

    #[inline]
    pub(crate) fn commit(&mut self, staged: Vec<ModelMessage>) {
        debug_assert!(staged_links_ok(&staged));
        self.messages.extend(staged);
    }

    /// Checks that every tool message answers a distinct call of the
    /// assistant message right before it, and that no call of an assistant
    /// message is left unanswered once another message follows.
    ///
    /// A trailing assistant message with unanswered calls is accepted, a
    /// request is still in flight in that case.
    pub fn check_tool_links(&self) -> Result<(), ToolLinkError> {
        let mut pending: HashSet<&str> = HashSet::new();
        let mut open = false;
        for (index, msg) in self.messages.iter().enumerate() {
            match msg {
                ModelMessage::Tool(result) => {
                    if !open || !pending.remove(result.tool_call_id.as_str()) {
                        return Err(ToolLinkError {
                            index,
                            tool_call_id: result.tool_call_id.clone(),
                            problem: LinkProblem::Orphan,
                        });
                    }
                }
                other => {
                    if let Some(unanswered) = pending.iter().next() {
                        return Err(ToolLinkError {
                            index,
                            tool_call_id: (*unanswered).to_owned(),
                            problem: LinkProblem::Unanswered,
                        });
                    }
                    pending = other.tool_calls().iter().map(|c| c.id.as_str()).collect();
                    open = !pending.is_empty();
                }
            }
        }
        Ok(())
    }
}

fn staged_links_ok(staged: &[ModelMessage]) -> bool {
    let Some(first) = staged.first() else {
        return true;
    };
    let calls = first.tool_calls();
    staged.len() == calls.len() + 1
        && calls.iter().zip(&staged[1..]).all(|(call, msg)| {
            matches!(msg, ModelMessage::Tool(result) if result.tool_call_id == call.id)
        })
}

/// What is wrong with a tool message link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkProblem {
    /// A tool message answers no call of the preceding assistant message,
    /// or answers one twice.
    Orphan,
    /// A call was never answered before the conversation moved on.
    Unanswered,
}

/// A broken link between tool calls and tool messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolLinkError {
    /// Index of the message where the problem was found.
    pub index: usize,
    /// The call id involved.
    pub tool_call_id: String,
    /// The kind of problem.
    pub problem: LinkProblem,
}

impl Display for ToolLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.problem {
            LinkProblem::Orphan => write!(
                f,
                "message {} answers unknown tool call `{}`",
                self.index, self.tool_call_id
            ),
            LinkProblem::Unanswered => write!(
                f,
                "tool call `{}` is unanswered at message {}",
                self.tool_call_id, self.index
            ),
        }
    }
}

impl std::error::Error for ToolLinkError {}
