use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolchat_model::ToolCall;

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "message_delta")]
    MessageDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCall),
}

/// The preset response for an assistant step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will fail in the first `failures` attempts.
    /// `Some(0)` means the request will fail infinitely.
    #[serde(default)]
    pub failures: Option<u64>,
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
        }
    }

    /// A plain text answer delivered as one delta.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::with_events([PresetEvent::MessageDelta(text.into())])
    }

    /// A response that only requests tools.
    pub fn tool_calls<I>(calls: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'static str, Value)>,
    {
        Self::with_events(
            calls
                .into_iter()
                .map(|(id, name, args)| {
                    PresetEvent::ToolCall(ToolCall::new(id, name, args))
                })
                .collect::<Vec<_>>(),
        )
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }
}
