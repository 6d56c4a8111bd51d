//! A local fake model for testing purpose.

mod preset;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::time::{Sleep, sleep};
use toolchat_model::{
    ErrorKind, ModelFinishReason, ModelMessage, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: Vec<PresetEvent>,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        // SAFETY: This type does not require to be pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if this.event_idx > this.events.len() {
            // In case this method is called after completion.
            return Poll::Ready(Ok(None));
        }

        if let Some(sleep) = &mut this.sleep {
            let sleep = sleep.as_mut();
            ready!(sleep.poll(cx));
            this.sleep = None;

            let event = if let Some(preset) = this.events.get(this.event_idx) {
                match preset {
                    PresetEvent::MessageDelta(msg) => {
                        ModelResponseEvent::MessageDelta(msg.clone())
                    }
                    PresetEvent::ToolCall(req) => {
                        ModelResponseEvent::ToolCall(req.clone())
                    }
                }
            } else {
                let has_tool_call = this
                    .events
                    .iter()
                    .any(|event| matches!(event, PresetEvent::ToolCall(_)));
                ModelResponseEvent::Completed(if has_tool_call {
                    ModelFinishReason::ToolCalls
                } else {
                    ModelFinishReason::Stop
                })
            };
            this.event_idx += 1;
            return Poll::Ready(Ok(Some(event)));
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Default)]
struct SharedState {
    attempts: Mutex<HashMap<usize, u64>>,
    requests: Mutex<Vec<ModelRequest>>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the script, which is how the
/// model should respond to a request. The response is selected by counting
/// the assistant messages already present in the request, so the first
/// request of a conversation gets the first response, the request after
/// one round of tool calls gets the second, and so on. When the script runs
/// out, the repeating response is used if one is set, otherwise an error is
/// returned.
///
/// Clones share the attempt counters and the request log.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Vec<PresetResponse>,
    repeating: Option<PresetResponse>,
    delay: Option<Duration>,
    state: Arc<SharedState>,
}

impl TestModelProvider {
    /// Appends a response to the script.
    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        self.script.push(preset);
    }

    /// Sets the response used once the script is exhausted.
    #[inline]
    pub fn set_repeating(&mut self, preset: PresetResponse) {
        self.repeating = Some(preset);
    }

    /// Sets the delay before every streamed event.
    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns every request received so far, including failed ones.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.state
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn select(&self, req: &ModelRequest) -> Result<PresetResponse, Error> {
        let step_idx = req
            .messages
            .iter()
            .filter(|msg| matches!(msg, ModelMessage::Assistant { .. }))
            .count();
        let Some(preset) = self.script.get(step_idx).or(self.repeating.as_ref())
        else {
            return Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Other,
            });
        };

        if let Some(failures) = preset.failures {
            let mut attempts = self
                .state
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let attempt = attempts.entry(step_idx).or_default();
            *attempt += 1;
            if failures == 0 || *attempt <= failures {
                return Err(Error {
                    message: "scripted failure",
                    kind: ErrorKind::RateLimitExceeded,
                });
            }
        }
        Ok(preset.clone())
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        if let Ok(mut requests) = self.state.requests.lock() {
            requests.push(req.clone());
        }
        let resp = self.select(req).map(|preset| TestModelResponse {
            events: preset.events,
            event_idx: 0,
            delay: self.delay.unwrap_or(Duration::from_millis(1)),
            sleep: None,
        });
        ready(resp)
    }
}

impl Debug for TestModelProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestModelProvider")
            .field("script_len", &self.script.len())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use serde_json::json;
    use toolchat_model::{ToolCall, ToolDescriptor, ToolResult};

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Vec<ToolCall>, ModelFinishReason) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_calls = vec![];
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                .await
                .unwrap()
                .unwrap();
            match event {
                ModelResponseEvent::Completed(reason) => {
                    assert!(
                        poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                            .await
                            .unwrap()
                            .is_none()
                    );
                    return (msg, tool_calls, reason);
                }
                ModelResponseEvent::MessageDelta(delta) => {
                    msg.push_str(&delta);
                }
                ModelResponseEvent::ToolCall(req) => tool_calls.push(req),
            }
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("Sure, ".to_owned()),
            PresetEvent::MessageDelta("let me check.".to_owned()),
            PresetEvent::ToolCall(ToolCall::new(
                "call:1",
                "get_current_time",
                json!({ "timezone": "UTC" }),
            )),
        ]));
        provider.add_response(PresetResponse::text("It is noon."));

        let mut req = ModelRequest {
            messages: vec![ModelMessage::user("What time is it?")],
            tools: vec![ToolDescriptor {
                name: "get_current_time".to_owned(),
                description: "Returns the current time".to_owned(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "timezone": { "type": "string" }
                    }
                }),
            }],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, tool_calls, reason) = collect_response(resp).await;
        assert_eq!(msg, "Sure, let me check.");
        assert_eq!(reason, ModelFinishReason::ToolCalls);
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "get_current_time");

        req.messages.push(ModelMessage::Assistant {
            content: msg,
            tool_calls,
        });
        req.messages.push(ModelMessage::Tool(ToolResult {
            tool_call_id: "call:1".to_owned(),
            content: "12:00".to_owned(),
        }));
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, tool_calls, reason) = collect_response(resp).await;
        assert_eq!(msg, "It is noon.");
        assert!(tool_calls.is_empty());
        assert_eq!(reason, ModelFinishReason::Stop);

        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_script_exhausted() {
        let provider = TestModelProvider::default();
        let req = ModelRequest {
            messages: vec![ModelMessage::user("Hi")],
            tools: vec![],
        };
        let err = provider.send_request(&req).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_repeating() {
        let mut provider = TestModelProvider::default();
        provider.set_repeating(PresetResponse::text("again"));
        let mut req = ModelRequest {
            messages: vec![ModelMessage::user("Hi")],
            tools: vec![],
        };
        for _ in 0..3 {
            let resp = provider.send_request(&req).await.unwrap();
            let (msg, _, _) = collect_response(resp).await;
            assert_eq!(msg, "again");
            req.messages.push(ModelMessage::assistant(msg));
        }
    }

    #[tokio::test]
    async fn test_failures() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text("ok").with_failures(2));
        let req = ModelRequest {
            messages: vec![ModelMessage::user("Hi")],
            tools: vec![],
        };

        let shared = provider.clone();
        for _ in 0..2 {
            let err = shared.send_request(&req).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        }
        assert!(provider.send_request(&req).await.is_ok());
    }
}
