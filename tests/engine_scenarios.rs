//! End-to-end scenarios for the Interaction Engine, S1-S6 from SPEC_FULL.md §8.

use std::sync::Arc;

use agent_runtime_core::cloudllm::context::{Context, TrimWindowPolicy};
use agent_runtime_core::cloudllm::engine::{AgentDefinition, Engine, InteractionOutcome};
use agent_runtime_core::cloudllm::error::EngineError;
use agent_runtime_core::cloudllm::guardrail::{GuardrailChain, PredicateGuardrail};
use agent_runtime_core::cloudllm::tool_registry::{Bm25Strategy, ToolDeclaration, ToolHandler, ToolRegistry};
use agent_runtime_core::cloudllm::transport::{NativeToolCall, StubTransport, TransportResponse};
use async_trait::async_trait;

struct Weather;

#[async_trait]
impl ToolHandler for Weather {
    async fn execute(&self, _tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, agent_runtime_core::DynError> {
        let city = arguments["city"].as_str().unwrap_or("unknown");
        Ok(serde_json::json!(format!("25C sunny in {}", city)))
    }
}

struct Compare;

#[async_trait]
impl ToolHandler for Compare {
    async fn execute(&self, _tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, agent_runtime_core::DynError> {
        Ok(serde_json::json!({ "a": arguments["a"], "b": arguments["b"] }))
    }
}

struct SendEmail;

#[async_trait]
impl ToolHandler for SendEmail {
    async fn execute(&self, _tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, agent_runtime_core::DynError> {
        Ok(arguments)
    }
}

#[tokio::test]
async fn s1_single_tool_single_turn() {
    let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
    registry
        .declare(ToolDeclaration::new("get_weather", "get weather for a city", serde_json::json!({})), Arc::new(Weather))
        .unwrap();

    let transport = StubTransport::new(
        "m",
        vec![
            TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall {
                    call_id: "c1".into(),
                    tool_name: "get_weather".into(),
                    arguments: serde_json::json!({ "city": "Tokyo" }),
                }],
                usage: None,
            },
            TransportResponse { text: Some("Weather in Tokyo: 25C sunny".into()), tool_calls: vec![], usage: None },
        ],
    );

    let engine = Engine::new(Arc::new(transport), Arc::new(registry), Box::new(TrimWindowPolicy::new(10_000)));
    let definition = AgentDefinition::new("weather-agent", "you report the weather", "m");
    let mut context = Context::new();
    let outcome = engine.interact("run-s1", &definition, &mut context, "Weather in Tokyo?").await.unwrap();

    match outcome {
        InteractionOutcome::Done { final_text } => assert!(final_text.contains("Tokyo")),
        _ => panic!("expected Done"),
    }
    assert_eq!(context.turn_count(), 2);
}

#[tokio::test]
async fn s2_parallel_plan_resolves_refs_across_waves() {
    let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
    registry
        .declare(ToolDeclaration::new("get_weather", "get weather for a city", serde_json::json!({})), Arc::new(Weather))
        .unwrap();
    registry
        .declare(ToolDeclaration::new("compare", "compare two values", serde_json::json!({})), Arc::new(Compare))
        .unwrap();

    let transport = StubTransport::new(
        "m",
        vec![
            TransportResponse {
                text: None,
                tool_calls: vec![
                    NativeToolCall { call_id: "c1".into(), tool_name: "get_weather".into(), arguments: serde_json::json!({ "city": "Tokyo" }) },
                    NativeToolCall { call_id: "c2".into(), tool_name: "get_weather".into(), arguments: serde_json::json!({ "city": "London" }) },
                    NativeToolCall {
                        call_id: "c3".into(),
                        tool_name: "compare".into(),
                        arguments: serde_json::json!({ "a": "$ref:c1", "b": "$ref:c2" }),
                    },
                ],
                usage: None,
            },
            TransportResponse { text: Some("Tokyo is sunnier".into()), tool_calls: vec![], usage: None },
        ],
    );

    let engine = Engine::new(Arc::new(transport), Arc::new(registry), Box::new(TrimWindowPolicy::new(10_000)));
    let definition = AgentDefinition::new("weather-agent", "you compare weather", "m");
    let mut context = Context::new();
    let outcome = engine.interact("run-s2", &definition, &mut context, "Compare weather in Tokyo vs London").await.unwrap();
    assert!(matches!(outcome, InteractionOutcome::Done { .. }));

    let tool_result_call_ids: Vec<String> = context
        .messages()
        .iter()
        .filter_map(|m| match m {
            agent_runtime_core::cloudllm::context::Message::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_result_call_ids, vec!["c1".to_string(), "c2".to_string(), "c3".to_string()]);
}

#[tokio::test]
async fn s3_confirmation_pause_then_resume() {
    let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
    registry
        .declare(
            ToolDeclaration::new("send_email", "send an email", serde_json::json!({})).requires_confirmation(),
            Arc::new(SendEmail),
        )
        .unwrap();
    let registry = Arc::new(registry);

    let transport = Arc::new(StubTransport::new(
        "m",
        vec![
            TransportResponse {
                text: None,
                tool_calls: vec![NativeToolCall {
                    call_id: "c1".into(),
                    tool_name: "send_email".into(),
                    arguments: serde_json::json!({ "to": "team", "body": "report" }),
                }],
                usage: None,
            },
            TransportResponse { text: Some("Email sent".into()), tool_calls: vec![], usage: None },
        ],
    ));

    let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000)));
    let definition = AgentDefinition::new("ops-agent", "you send emails", "m");
    let mut context = Context::new();
    let outcome = engine.interact("run-s3", &definition, &mut context, "Email report to team").await.unwrap();

    let snapshot = match outcome {
        InteractionOutcome::Paused { snapshot } => snapshot,
        _ => panic!("expected Paused"),
    };
    assert_eq!(snapshot.pending_batch.len(), 1);
    assert!(!context.messages().iter().any(|m| matches!(
        m,
        agent_runtime_core::cloudllm::context::Message::ToolResult { call_id, .. } if call_id == "c1"
    )));

    let dir = tempfile::tempdir().unwrap();
    let path = snapshot.save(dir.path()).unwrap();
    let mut reloaded = agent_runtime_core::cloudllm::snapshot::RunSnapshot::load(&path).unwrap();
    reloaded.decide("c1", true);

    let resumed = engine.resume("run-s3", &definition, &mut context, &reloaded).await.unwrap();
    match resumed {
        InteractionOutcome::Done { final_text } => assert_eq!(final_text, "Email sent"),
        _ => panic!("expected Done after resume"),
    }
}

#[tokio::test]
async fn s4_output_guardrail_rejects_long_response() {
    let registry = Arc::new(ToolRegistry::new(Box::new(Bm25Strategy::default())));
    let transport = Arc::new(StubTransport::with_text_reply("hello world!!"));
    let engine = Engine::new(transport, registry, Box::new(TrimWindowPolicy::new(10_000))).with_output_guardrails(
        GuardrailChain::new().with(Box::new(PredicateGuardrail::new("short_replies_only", |v: &str| {
            if v.len() > 10 { Some("response too long".into()) } else { None }
        }))),
    );
    let definition = AgentDefinition::new("greeter", "say hi", "m");
    let mut context = Context::new();
    let result = engine.interact("run-s4", &definition, &mut context, "hi").await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), "output_guardrail_reject");
    assert!(matches!(err, EngineError::OutputGuardrailReject { .. }));
    assert_eq!(context.messages().len(), 2);
}

#[tokio::test]
async fn s6_max_turns_exceeded_when_llm_keeps_calling_tools() {
    let mut registry = ToolRegistry::new(Box::new(Bm25Strategy::default()));
    registry
        .declare(ToolDeclaration::new("get_weather", "get weather for a city", serde_json::json!({})), Arc::new(Weather))
        .unwrap();
    let transport = Arc::new(StubTransport::new(
        "m",
        vec![TransportResponse {
            text: None,
            tool_calls: vec![NativeToolCall { call_id: "c1".into(), tool_name: "get_weather".into(), arguments: serde_json::json!({ "city": "Tokyo" }) }],
            usage: None,
        }],
    ));
    let engine = Engine::new(transport, Arc::new(registry), Box::new(TrimWindowPolicy::new(10_000)));
    let definition = AgentDefinition::new("weather-agent", "you report the weather", "m").with_max_turns(2);
    let mut context = Context::new();
    let result = engine.interact("run-s6", &definition, &mut context, "Weather in Tokyo, forever?").await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), "max_turns_exceeded");

    let tool_result_count = context
        .messages()
        .iter()
        .filter(|m| matches!(m, agent_runtime_core::cloudllm::context::Message::ToolResult { .. }))
        .count();
    assert_eq!(tool_result_count, 2);
}
