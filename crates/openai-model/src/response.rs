use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::future::BoxFuture;
use pin_project_lite::pin_project;
use serde_json::{Map, Value};
use toolchat_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent, ToolCall,
};
use toolchat_sse::{Error as SseError, Sse};

use crate::Error;
use crate::proto::{ChatCompletionChunk, ToolCall as PartialToolCall};

struct PartialState {
    sse: Sse,
    // Tool calls stream in fragments keyed by `index`. They are only handed
    // out once the stream says it is finished, when every argument string
    // is complete.
    tool_calls: Vec<PartialToolCall>,
    pending_events: VecDeque<ModelResponseEvent>,
    finished: bool,
}

impl PartialState {
    fn merge_tool_call(&mut self, fragment: PartialToolCall) {
        let existing = self
            .tool_calls
            .iter_mut()
            .find(|t| t.index.is_some() && t.index == fragment.index);
        let Some(partial) = existing else {
            self.tool_calls.push(fragment);
            return;
        };
        if let Some(id) = fragment.id {
            partial.id.get_or_insert_default().push_str(&id);
        }
        if let Some(function) = fragment.function {
            let partial_func = partial.function.get_or_insert_default();
            if let Some(name) = function.name {
                partial_func.name.get_or_insert_default().push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                partial_func
                    .arguments
                    .get_or_insert_default()
                    .push_str(&arguments);
            }
        }
    }

    fn finish(&mut self, reason: Option<ModelFinishReason>) {
        let has_tool_calls = !self.tool_calls.is_empty();
        for (position, partial) in self.tool_calls.drain(..).enumerate() {
            self.pending_events.push_back(ModelResponseEvent::ToolCall(
                complete_tool_call(partial, position),
            ));
        }
        let reason = reason.unwrap_or(if has_tool_calls {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        });
        self.pending_events
            .push_back(ModelResponseEvent::Completed(reason));
        self.finished = true;
    }
}

type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<BoxFuture<'static, NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            tool_calls: Default::default(),
            pending_events: Default::default(),
            finished: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = partial_state.pending_events.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.finished {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("stream ended without a finish reason");
                partial_state.finish(None);
                continue;
            }
            Err(err) => {
                let kind = match err {
                    SseError::ChunksError(_) => ErrorKind::Transport,
                    SseError::InvalidPayload => ErrorKind::InvalidResponse,
                };
                return Err(Error::new(format!("{err}"), kind));
            }
        };
        trace!("got sse event: {}", sse_event.data);
        if sse_event.data.is_empty() {
            continue;
        }
        if sse_event.data == "[DONE]" {
            partial_state.finish(None);
            continue;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event.data)
            .map_err(|err| {
                Error::new(format!("bad chunk: {err}"), ErrorKind::InvalidResponse)
            })?;
        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                partial_state
                    .pending_events
                    .push_back(ModelResponseEvent::MessageDelta(content));
            }
        }
        for fragment in choice.delta.tool_calls.into_iter().flatten() {
            partial_state.merge_tool_call(fragment);
        }
        if let Some(finish_reason) = choice.finish_reason {
            let reason = match finish_reason.as_str() {
                "tool_calls" | "function_call" => ModelFinishReason::ToolCalls,
                "length" => ModelFinishReason::Length,
                "content_filter" => {
                    return Err(Error::new(
                        "the response was filtered",
                        ErrorKind::Moderated,
                    ));
                }
                _ => ModelFinishReason::Stop,
            };
            partial_state.finish(Some(reason));
        }
    }
}

// Some compatible servers omit call ids. Results are linked to calls by id,
// so a missing one is replaced by `call_{position}`.
fn complete_tool_call(partial: PartialToolCall, position: usize) -> ToolCall {
    let function = partial.function.unwrap_or_default();
    let name = function.name.unwrap_or_default();
    let raw_arguments = function.arguments.unwrap_or_default();
    let arguments = if raw_arguments.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str::<Value>(&raw_arguments).unwrap_or_else(|err| {
            warn!("arguments of `{name}` are not valid JSON: {err}");
            Value::Object(Map::new())
        })
    };
    let id = partial
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{position}"));
    ToolCall::new(id, name, arguments)
}
