use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use toolchat_model::{ErrorKind as ModelErrorKind, ModelMessage, ToolDescriptor};
use toolchat_test_model::{PresetEvent, PresetResponse, TestModelProvider};

use super::*;
use crate::tool::ErrorKind;

struct FakeTool {
    name: &'static str,
    delay: Duration,
    output: Result<&'static str, &'static str>,
}

impl FakeTool {
    fn ok(name: &'static str, output: &'static str) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            output: Ok(output),
        }
    }

    fn failing(name: &'static str, reason: &'static str) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            output: Err(reason),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct FakeRegistry {
    tools: Vec<FakeTool>,
    broken: bool,
    // Names in the order the invocations finished.
    finished: Mutex<Vec<String>>,
}

impl FakeRegistry {
    fn with(tools: impl IntoIterator<Item = FakeTool>) -> Self {
        Self {
            tools: tools.into_iter().collect(),
            ..Default::default()
        }
    }

    fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRegistry for FakeRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        if self.broken {
            return Err(ToolError::transport().with_reason("connection closed"));
        }
        Ok(self
            .tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.to_owned(),
                description: String::new(),
                input_schema: json!({ "type": "object" }),
            })
            .collect())
    }

    async fn invoke(&self, name: &str, _arguments: Map<String, Value>) -> ToolOutcome {
        let Some(tool) = self.tools.iter().find(|tool| tool.name == name) else {
            return Err(ToolError::not_found(name));
        };
        sleep(tool.delay).await;
        self.finished.lock().unwrap().push(name.to_owned());
        tool.output
            .map(str::to_owned)
            .map_err(|reason| ToolError::execution_error().with_reason(reason))
    }
}

fn conversation() -> Conversation {
    let mut conversation = Conversation::with_system_prompt("you are a helpful assistant.");
    conversation.push_user("Hi");
    conversation
}

fn tool_contents(conversation: &Conversation) -> Vec<(String, String)> {
    conversation
        .messages()
        .iter()
        .filter_map(|msg| match msg {
            ModelMessage::Tool(result) => {
                Some((result.tool_call_id.clone(), result.content.clone()))
            }
            _ => None,
        })
        .collect()
}

fn error_of(content: &str) -> String {
    let value: Value = serde_json::from_str(content).unwrap();
    value["error"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn test_plain_answer() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::text("Hello!"));
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry::with([FakeTool::ok("a", "A")]);

    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::Answer("Hello!".to_owned()));
    assert_eq!(conversation.len(), 3);
    assert_eq!(conversation.last().unwrap().text(), "Hello!");
    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "a");
    assert!(registry.finished().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_results_follow_call_order() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([
        ("1", "a", json!({})),
        ("2", "b", json!({})),
        ("3", "c", json!({})),
    ]));
    provider.add_response(PresetResponse::text("done"));
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry::with([
        FakeTool::ok("a", "A").delayed(Duration::from_millis(30)),
        FakeTool::ok("b", "B").delayed(Duration::from_millis(10)),
        FakeTool::ok("c", "C"),
    ]);

    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.answer(), Some("done"));
    assert_eq!(registry.finished(), ["c", "b", "a"]);
    assert_eq!(
        tool_contents(&conversation),
        [
            ("1".to_owned(), "A".to_owned()),
            ("2".to_owned(), "B".to_owned()),
            ("3".to_owned(), "C".to_owned()),
        ]
    );
    // system, user, assistant with calls, 3 results, answer
    assert_eq!(conversation.len(), 7);
    assert_eq!(conversation.messages()[2].tool_calls().len(), 3);
    conversation.check_tool_links().unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([
        ("1", "a", json!({})),
        ("2", "b", json!({})),
    ]));
    provider.add_response(PresetResponse::text("done"));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([
        FakeTool::ok("a", "A").delayed(Duration::from_millis(30)),
        FakeTool::ok("b", "B"),
    ]);

    let options = TurnOptions::default().with_parallel_tool_calls(false);
    let mut conversation = conversation();
    run_turn(&mut conversation, &registry, &client, &options)
        .await
        .unwrap();

    assert_eq!(registry.finished(), ["a", "b"]);
}

#[tokio::test]
async fn test_failing_tool() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([
        ("1", "a", json!({})),
        ("2", "b", json!({})),
    ]));
    provider.add_response(PresetResponse::text("Sorry, b is broken."));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([
        FakeTool::ok("a", "A"),
        FakeTool::failing("b", "disk is full"),
    ]);

    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.answer(), Some("Sorry, b is broken."));
    let contents = tool_contents(&conversation);
    assert_eq!(contents[0].1, "A");
    assert!(error_of(&contents[1].1).contains("disk is full"));
}

#[tokio::test]
async fn test_unknown_tool() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([("1", "weather", json!({}))]));
    provider.add_response(PresetResponse::text("I can't check the weather."));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([FakeTool::ok("a", "A")]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = TurnObserver::default().on_tool_result({
        let seen = Arc::clone(&seen);
        move |call, outcome| {
            let kind = outcome.as_ref().err().map(|err| err.kind());
            seen.lock().unwrap().push((call.name.clone(), kind));
        }
    });
    let mut conversation = conversation();
    let outcome = run_turn_observed(
        &mut conversation,
        &registry,
        &client,
        &TurnOptions::default(),
        &observer,
    )
    .await
    .unwrap();

    assert!(outcome.answer().is_some());
    assert!(registry.finished().is_empty());
    let contents = tool_contents(&conversation);
    assert_eq!(contents.len(), 1);
    assert!(error_of(&contents[0].1).contains("weather"));
    assert_eq!(
        *seen.lock().unwrap(),
        [("weather".to_owned(), Some(ErrorKind::NotFound))]
    );
}

#[tokio::test]
async fn test_iteration_budget() {
    let mut provider = TestModelProvider::default();
    provider.set_repeating(PresetResponse::tool_calls([("1", "a", json!({}))]));
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry::with([FakeTool::ok("a", "A")]);

    let options = TurnOptions::default().with_max_iterations(Some(3));
    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &options)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::BudgetExceeded(BudgetExceeded {
            reason: BudgetReason::Iterations,
            iterations: 3,
        })
    );
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(registry.finished().len(), 3);
    // system, user, then a call and its result per iteration
    assert_eq!(conversation.len(), 8);
    conversation.check_tool_links().unwrap();
}

#[tokio::test]
async fn test_zero_iterations() {
    let provider = TestModelProvider::default();
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry::default();

    let options = TurnOptions::default().with_max_iterations(Some(0));
    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &options)
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        TurnOutcome::BudgetExceeded(BudgetExceeded { iterations: 0, .. })
    ));
    assert!(provider.requests().is_empty());
    assert_eq!(conversation.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_time_budget_discards_partial_iteration() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([
        ("1", "fast", json!({})),
        ("2", "slow", json!({})),
    ]));
    provider.add_response(PresetResponse::text("unreachable"));
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry::with([
        FakeTool::ok("fast", "F"),
        FakeTool::ok("slow", "S").delayed(Duration::from_secs(10)),
    ]);

    let options = TurnOptions::default().with_time_budget(Some(Duration::from_secs(1)));
    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &options)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::BudgetExceeded(BudgetExceeded {
            reason: BudgetReason::Deadline,
            iterations: 1,
        })
    );
    assert_eq!(registry.finished(), ["fast"]);
    assert_eq!(conversation.len(), 2);
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([("1", "slow", json!({}))]));
    provider.add_response(PresetResponse::text("It took too long."));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([
        FakeTool::ok("slow", "S").delayed(Duration::from_secs(10)),
    ]);

    let options = TurnOptions::default().with_tool_timeout(Some(Duration::from_millis(100)));
    let mut conversation = conversation();
    let outcome = run_turn(&mut conversation, &registry, &client, &options)
        .await
        .unwrap();

    assert_eq!(outcome.answer(), Some("It took too long."));
    let contents = tool_contents(&conversation);
    assert!(error_of(&contents[0].1).starts_with("Timed out"));
}

#[tokio::test]
async fn test_provider_error() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::text("never").with_failures(0));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::default();

    let mut conversation = conversation();
    let err = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.completion_kind(), Some(ModelErrorKind::RateLimitExceeded));
    assert_eq!(conversation.len(), 2);
}

#[tokio::test]
async fn test_provider_error_keeps_finished_iterations() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([("1", "a", json!({}))]));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([FakeTool::ok("a", "A")]);

    let mut conversation = conversation();
    let err = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.completion_kind(), Some(ModelErrorKind::Other));
    assert_eq!(conversation.len(), 4);
    conversation.check_tool_links().unwrap();
}

#[tokio::test]
async fn test_registry_error() {
    let provider = TestModelProvider::default();
    let client = ModelClient::new(provider.clone());
    let registry = FakeRegistry {
        broken: true,
        ..Default::default()
    };

    let mut conversation = conversation();
    let err = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Registry(_)));
    assert!(err.to_string().contains("connection closed"));
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_current_time_scenario() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::ToolCall(ToolCall::new(
            "call_0",
            "get_current_time",
            json!({ "timezone": "Asia/Tokyo" }),
        )),
    ]));
    provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("It is 21:00 ".to_owned()),
        PresetEvent::MessageDelta("in Tokyo.".to_owned()),
    ]));
    let client = ModelClient::new(provider);
    let registry = FakeRegistry::with([FakeTool::ok(
        "get_current_time",
        "2025-01-01T21:00:00+09:00",
    )]);

    let deltas = Arc::new(Mutex::new(String::new()));
    let observer = TurnObserver::default().on_transcript({
        let deltas = Arc::clone(&deltas);
        move |delta| deltas.lock().unwrap().push_str(delta)
    });
    let mut conversation = Conversation::new();
    conversation.push_user("What time is it in Tokyo?");
    let outcome = run_turn_observed(
        &mut conversation,
        &registry,
        &client,
        &TurnOptions::default(),
        &observer,
    )
    .await
    .unwrap();

    assert_eq!(outcome.answer(), Some("It is 21:00 in Tokyo."));
    assert_eq!(*deltas.lock().unwrap(), "It is 21:00 in Tokyo.");
    let messages = conversation.messages();
    assert_eq!(messages.len(), 4);
    assert!(matches!(messages[0], ModelMessage::User { .. }));
    assert_eq!(messages[1].tool_calls()[0].name, "get_current_time");
    assert_eq!(
        tool_contents(&conversation),
        [("call_0".to_owned(), "2025-01-01T21:00:00+09:00".to_owned())]
    );
    assert_eq!(messages[3].text(), "It is 21:00 in Tokyo.");
}

#[tokio::test]
async fn test_current_time_in_utc() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::tool_calls([(
        "call_0",
        "get_current_time",
        json!({ "timezone": "UTC" }),
    )]));
    provider.add_response(PresetResponse::text(
        "The current time in UTC is 14:30 on July 25, 2023.",
    ));
    let client = ModelClient::new(provider);
    let registry =
        FakeRegistry::with([FakeTool::ok("get_current_time", "2023-07-25T14:30:00")]);

    let mut conversation = Conversation::new();
    conversation.push_user("What time is it in UTC?");
    let outcome = run_turn(&mut conversation, &registry, &client, &TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(
        outcome.answer(),
        Some("The current time in UTC is 14:30 on July 25, 2023.")
    );
    let messages = conversation.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0], ModelMessage::user("What time is it in UTC?"));
    let calls = messages[1].tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments["timezone"], "UTC");
    assert_eq!(
        tool_contents(&conversation),
        [("call_0".to_owned(), "2023-07-25T14:30:00".to_owned())]
    );
    assert_eq!(
        messages[3],
        ModelMessage::assistant("The current time in UTC is 14:30 on July 25, 2023.")
    );
}

#[test]
fn test_options_serde() {
    let options: TurnOptions =
        serde_json::from_value(json!({ "time_budget": 2.5 })).unwrap();
    assert_eq!(options.max_iterations, Some(16));
    assert_eq!(options.time_budget, Some(Duration::from_millis(2500)));
    assert!(options.parallel_tool_calls);
}
