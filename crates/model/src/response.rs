use std::pin::Pin;
use std::task::{self, Poll};

use serde::{Deserialize, Serialize};

use crate::ToolCall;
use crate::provider::ModelProviderError;

/// A streaming response from the model provider.
pub trait ModelResponse: Sized + Send + 'static {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Attempts to pull out the next event from the response.
    ///
    /// # Return value
    ///
    /// - `Poll::Pending` means that this response is still waiting for
    ///   the next event. Implementations will ensure that the current
    ///   task will be notified when the next event may be ready.
    /// - `Poll::Ready(Ok(Some(event)))` means the response has an event
    ///   to deliver, and may produce further events on subsequent
    ///   `poll_next_event` calls.
    /// - `Poll::Ready(Ok(None))` means the response has completed.
    /// - `Poll::Ready(Err(error))` means an error occurred while
    ///   processing the response.
    ///
    /// Calling this method after completion should always return `None`.
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>>;
}

/// The reason why a model response has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFinishReason {
    /// The model needs to call a tool.
    ToolCalls,
    /// The model has finished generating text.
    Stop,
    /// The output was cut off by a token limit.
    Length,
}

/// The event from a model response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelResponseEvent {
    /// The response has been completed.
    Completed(ModelFinishReason),
    /// Received a message delta.
    MessageDelta(String),
    /// Received a complete tool call request.
    ToolCall(ToolCall),
}
