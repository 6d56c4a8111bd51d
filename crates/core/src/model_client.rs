use std::fmt::{self, Debug};
use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;

use toolchat_model::{
    ModelFinishReason, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent, ToolCall,
};
use tracing::Instrument;

type SendRequestResult = Result<Completion, Box<dyn ModelProviderError>>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, Box<dyn Fn(String) + Send + 'static>)
        -> BoxedSendRequestFuture + Send + Sync
>;

/// A wrapper around a model provider that drains the provider's event
/// stream and provides a type-erased interface for the other modules.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    /// Wraps `provider`.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req, on_transcript| {
            let fut = provider.send_request(&req);
            let message_count = req.messages.len();
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_transcript).await
                }
                .instrument(trace_span!("model client req", message_count)),
            )
        });
        Self { handler_fn }
    }

    /// Sends a request and collects the whole response.
    ///
    /// Every text delta is passed to `on_transcript` as soon as it arrives.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    #[inline]
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_transcript: impl Fn(String) + Send + 'static,
    ) -> Result<Completion, Box<dyn ModelProviderError>> {
        (self.handler_fn)(req, Box::new(on_transcript)).await
    }
}

impl Debug for ModelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelClient").finish_non_exhaustive()
    }
}

/// A completely received response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The model answered without asking for tools.
    Text(String),
    /// The model asked for tools. `content` holds any text it produced
    /// before the calls.
    ToolCalls {
        /// Text produced alongside the calls, often empty.
        content: String,
        /// Requested calls in the order the model emitted them.
        calls: Vec<ToolCall>,
    },
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_transcript: Box<dyn Fn(String) + Send + 'static>,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            error!("got an error: {err:?}");
            return Err(Box::new(err));
        }
    };

    let mut transcript = String::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = None;

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(event) => event,
            Err(err) => {
                error!("got an error: {err:?}");
                return Err(Box::new(err));
            }
        };

        let Some(event) = event else {
            break;
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(msg) => {
                transcript.push_str(&msg);
                on_transcript(msg);
            }
            ModelResponseEvent::ToolCall(req) => {
                tool_calls.push(req);
            }
            ModelResponseEvent::Completed(reason) => {
                finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request ({finish_reason:?})");
    if finish_reason == Some(ModelFinishReason::Length) {
        warn!("the response was truncated by the token limit");
    }

    if tool_calls.is_empty() {
        Ok(Completion::Text(transcript))
    } else {
        Ok(Completion::ToolCalls {
            content: transcript,
            calls: tool_calls,
        })
    }
}
