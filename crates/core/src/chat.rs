//! The tool-calling chat loop.
//!
//! One call to [`run_turn`] answers the latest user message: the model is
//! asked for a completion, every tool it requests is run through the
//! registry, the results are fed back, and this repeats until the model
//! answers in plain text or a budget runs out.
//!
//! Messages of one iteration (the assistant message carrying the calls and
//! one tool message per call) are staged and committed to the conversation
//! together after every await of that iteration has finished. Dropping the
//! turn future, or hitting the time budget, therefore never leaves half an
//! iteration behind.

#[cfg(test)]
mod tests;

use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Instant, timeout, timeout_at};
use toolchat_model::{
    ErrorKind as ModelErrorKind, ModelMessage, ModelProviderError,
    ModelRequest, ToolCall, ToolDescriptor, ToolResult,
};
use tracing::Instrument;

use crate::conversation::Conversation;
use crate::model_client::{Completion, ModelClient};
use crate::tool::{Error as ToolError, ToolOutcome, ToolRegistry};

const DEFAULT_MAX_ITERATIONS: u32 = 16;

/// Limits and execution settings for one turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnOptions {
    /// Maximum number of completions in one turn. `None` is unbounded.
    pub max_iterations: Option<u32>,
    /// Wall-clock budget for the whole turn, tool listing included.
    #[serde(with = "opt_secs")]
    pub time_budget: Option<Duration>,
    /// Budget for a single tool invocation. A tool exceeding it produces an
    /// error result instead of failing the turn.
    #[serde(with = "opt_secs")]
    pub tool_timeout: Option<Duration>,
    /// Run the calls of one assistant message concurrently.
    pub parallel_tool_calls: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
            time_budget: None,
            tool_timeout: None,
            parallel_tool_calls: true,
        }
    }
}

impl TurnOptions {
    /// Sets the iteration cap.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the wall-clock budget.
    #[inline]
    pub fn with_time_budget(mut self, time_budget: Option<Duration>) -> Self {
        self.time_budget = time_budget;
        self
    }

    /// Sets the per-tool timeout.
    #[inline]
    pub fn with_tool_timeout(mut self, tool_timeout: Option<Duration>) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    /// Enables or disables concurrent tool calls.
    #[inline]
    pub fn with_parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// Why a turn stopped before the model produced an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BudgetReason {
    /// The iteration cap was reached.
    Iterations,
    /// The wall-clock budget elapsed.
    Deadline,
}

/// A turn that ran out of budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BudgetExceeded {
    /// Which budget ran out.
    pub reason: BudgetReason,
    /// Completions requested before stopping.
    pub iterations: u32,
}

impl Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            BudgetReason::Iterations => write!(
                f,
                "stopped after {} model calls without a final answer",
                self.iterations
            ),
            BudgetReason::Deadline => write!(
                f,
                "time budget elapsed after {} model calls",
                self.iterations
            ),
        }
    }
}

/// How a turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model's final text answer.
    Answer(String),
    /// A budget ran out first.
    BudgetExceeded(BudgetExceeded),
}

impl TurnOutcome {
    /// Returns the answer, if the turn produced one.
    #[inline]
    pub fn answer(&self) -> Option<&str> {
        match self {
            TurnOutcome::Answer(text) => Some(text),
            TurnOutcome::BudgetExceeded(_) => None,
        }
    }
}

/// Errors that end a turn.
pub enum ChatError {
    /// Listing the tools failed.
    Registry(ToolError),
    /// The completion provider failed.
    Completion(Box<dyn ModelProviderError>),
}

impl ChatError {
    /// Returns the provider error kind, if the provider failed.
    #[inline]
    pub fn completion_kind(&self) -> Option<ModelErrorKind> {
        match self {
            ChatError::Registry(_) => None,
            ChatError::Completion(err) => Some(err.kind()),
        }
    }
}

impl Debug for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Registry(err) => f.debug_tuple("Registry").field(err).finish(),
            ChatError::Completion(err) => {
                f.debug_tuple("Completion").field(err).finish()
            }
        }
    }
}

impl Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Registry(err) => write!(f, "failed to list tools: {err}"),
            ChatError::Completion(err) => {
                write!(f, "completion failed ({}): {err}", err.kind())
            }
        }
    }
}

impl std::error::Error for ChatError {}

type TranscriptFn = Arc<dyn Fn(&str) + Send + Sync>;
type ToolResultFn = Arc<dyn Fn(&ToolCall, &ToolOutcome) + Send + Sync>;

/// Callbacks for following a turn while it runs.
#[derive(Clone, Default)]
pub struct TurnObserver {
    on_transcript: Option<TranscriptFn>,
    on_tool_result: Option<ToolResultFn>,
}

impl TurnObserver {
    /// Called with every streamed text delta.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.on_transcript = Some(Arc::new(on_transcript));
        self
    }

    /// Called once per tool call when its result is known.
    #[inline]
    pub fn on_tool_result(
        mut self,
        on_tool_result: impl Fn(&ToolCall, &ToolOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_result = Some(Arc::new(on_tool_result));
        self
    }
}

impl Debug for TurnObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnObserver")
            .field("on_transcript", &self.on_transcript.is_some())
            .field("on_tool_result", &self.on_tool_result.is_some())
            .finish()
    }
}

/// Runs one turn on `conversation` until the model answers or a budget
/// runs out.
///
/// Tool failures, unknown tool names and tool timeouts are reported to the
/// model as `{"error": ...}` results and the loop carries on. A failing
/// provider ends the turn with [`ChatError::Completion`]; it is not retried
/// here.
pub async fn run_turn(
    conversation: &mut Conversation,
    registry: &dyn ToolRegistry,
    client: &ModelClient,
    options: &TurnOptions,
) -> Result<TurnOutcome, ChatError> {
    run_turn_observed(conversation, registry, client, options, &TurnObserver::default())
        .await
}

/// Same as [`run_turn`], reporting progress to `observer`.
pub async fn run_turn_observed(
    conversation: &mut Conversation,
    registry: &dyn ToolRegistry,
    client: &ModelClient,
    options: &TurnOptions,
    observer: &TurnObserver,
) -> Result<TurnOutcome, ChatError> {
    let deadline = options.time_budget.map(|budget| Instant::now() + budget);
    let mut iterations = 0;
    let exceeded = |reason, iterations| {
        debug!("budget exceeded: {reason:?} after {iterations} iterations");
        Ok(TurnOutcome::BudgetExceeded(BudgetExceeded { reason, iterations }))
    };

    let Some(tools) = within(deadline, registry.list_tools()).await else {
        return exceeded(BudgetReason::Deadline, iterations);
    };
    let tools = tools.map_err(ChatError::Registry)?;
    debug!("starting a turn with {} tools", tools.len());

    loop {
        if options.max_iterations.is_some_and(|max| iterations >= max) {
            return exceeded(BudgetReason::Iterations, iterations);
        }
        iterations += 1;

        let request = ModelRequest {
            messages: conversation.messages().to_vec(),
            tools: tools.clone(),
        };
        let on_transcript = observer.on_transcript.clone();
        let completion = client.send_request(request, move |delta| {
            if let Some(on_transcript) = &on_transcript {
                on_transcript(&delta);
            }
        });
        let Some(completion) = within(deadline, completion).await else {
            return exceeded(BudgetReason::Deadline, iterations);
        };

        let (content, calls) = match completion.map_err(ChatError::Completion)? {
            Completion::Text(text) => {
                conversation.push(ModelMessage::assistant(text.clone()));
                debug!("turn finished after {iterations} iterations");
                return Ok(TurnOutcome::Answer(text));
            }
            Completion::ToolCalls { content, calls } => (content, calls),
        };

        let span = debug_span!("tool calls", iteration = iterations, count = calls.len());
        let outcomes = execute_calls(&calls, &tools, registry, options, observer)
            .instrument(span);
        let Some(outcomes) = within(deadline, outcomes).await else {
            return exceeded(BudgetReason::Deadline, iterations);
        };

        let mut staged = Vec::with_capacity(calls.len() + 1);
        let results: Vec<_> = calls
            .iter()
            .zip(outcomes)
            .map(|(call, outcome)| {
                ModelMessage::Tool(ToolResult {
                    tool_call_id: call.id.clone(),
                    content: render_outcome(outcome),
                })
            })
            .collect();
        staged.push(ModelMessage::Assistant {
            content,
            tool_calls: calls,
        });
        staged.extend(results);
        conversation.commit(staged);
    }
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn execute_calls(
    calls: &[ToolCall],
    tools: &[ToolDescriptor],
    registry: &dyn ToolRegistry,
    options: &TurnOptions,
    observer: &TurnObserver,
) -> Vec<ToolOutcome> {
    let futs = calls
        .iter()
        .map(|call| execute_call(call, tools, registry, options.tool_timeout, observer));
    if options.parallel_tool_calls {
        join_all(futs).await
    } else {
        let mut outcomes = Vec::with_capacity(calls.len());
        for fut in futs {
            outcomes.push(fut.await);
        }
        outcomes
    }
}

async fn execute_call(
    call: &ToolCall,
    tools: &[ToolDescriptor],
    registry: &dyn ToolRegistry,
    tool_timeout: Option<Duration>,
    observer: &TurnObserver,
) -> ToolOutcome {
    let outcome = if !tools.iter().any(|tool| tool.name == call.name) {
        warn!("model requested unknown tool `{}`", call.name);
        Err(ToolError::not_found(&call.name))
    } else {
        trace!("invoking `{}` ({})", call.name, call.id);
        let invocation = registry.invoke(&call.name, call.arguments.clone());
        match tool_timeout {
            Some(limit) => timeout(limit, invocation).await.unwrap_or_else(|_| {
                Err(ToolError::timeout()
                    .with_reason(format!("no result after {limit:?}")))
            }),
            None => invocation.await,
        }
    };
    if let Err(err) = &outcome {
        debug!("tool `{}` failed: {err}", call.name);
    }
    if let Some(on_tool_result) = &observer.on_tool_result {
        on_tool_result(call, &outcome);
    }
    outcome
}

fn render_outcome(outcome: ToolOutcome) -> String {
    match outcome {
        Ok(content) => content,
        Err(err) => json!({ "error": err.to_string() }).to_string(),
    }
}
