//! Integration tests for the sequential fallback chain.

use caproute::{
    CapabilityDef, DispatchEngine, DispatchError, EngineConfig, ExecuteRequest, HandlerDescriptor,
    HandlerResponse, Payload, SourceEvent, SourceKind,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn text_handler(id: &str, priority: i32, text: &str) -> HandlerDescriptor {
    let text = text.to_string();
    HandlerDescriptor::new(id, id, SourceKind::AiProvider, move |_| {
        let text = text.clone();
        Box::pin(async move { Ok(HandlerResponse::ok(Payload::Text(text))) })
    })
    .with_capability("generate")
    .with_priority(priority)
}

fn failing_handler(id: &str, priority: i32, error: &str) -> HandlerDescriptor {
    let error = error.to_string();
    HandlerDescriptor::new(id, id, SourceKind::AiProvider, move |_| {
        let error = error.clone();
        Box::pin(async move { Err(DispatchError::HandlerException(error)) })
    })
    .with_capability("generate")
    .with_priority(priority)
}

#[tokio::test]
async fn test_unknown_capability_is_terminal_with_no_attempts() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "hello")).await;

    let result = engine.execute(ExecuteRequest::new("no-such-cap", "x")).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("capability not found"));
    assert!(result.fallbacks_attempted.is_empty());
    assert!(engine.diagnostics_log().is_empty());
}

#[tokio::test]
async fn test_disabled_capability_is_terminal() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "hello")).await;
    engine.catalog().set_enabled("generate", false).await.unwrap();

    let result = engine.execute(ExecuteRequest::new("generate", "x")).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("disabled"));
    assert!(engine.diagnostics_log().is_empty());
}

#[tokio::test]
async fn test_no_eligible_handlers() {
    let engine = DispatchEngine::default();
    let result = engine.execute(ExecuteRequest::new("generate", "x")).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("no eligible handlers"));
    assert!(engine.diagnostics_log().is_empty());
}

#[tokio::test]
async fn test_first_handler_success_leaves_no_fallbacks() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "hello world")).await;
    engine.register_handler(text_handler("deepseek", 70, "other")).await;

    let result = engine.execute(ExecuteRequest::new("generate", "say hi")).await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("gemini"));
    assert_eq!(result.payload, Some(Payload::Text("hello world".to_string())));
    assert!(result.fallbacks_attempted.is_empty());
    assert_eq!(engine.diagnostics_log().len(), 1);
}

#[tokio::test]
async fn test_exception_falls_back_to_next_handler() {
    // Scenario from the engine's contract: gemini throws, deepseek answers.
    let engine = DispatchEngine::default();
    engine.register_handler(failing_handler("gemini", 80, "quota exceeded")).await;
    engine.register_handler(text_handler("deepseek", 70, "hello")).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_max_retries(0))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);
    assert_eq!(result.source, Some(SourceKind::AiProvider));

    let log = engine.diagnostics_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].handler_id, "gemini");
    assert!(!log[0].success);
    assert!(log[0].errors[0].contains("quota exceeded"));
    assert_eq!(log[1].handler_id, "deepseek");
    assert!(log[1].success);
}

#[tokio::test]
async fn test_validation_failure_triggers_fallback() {
    // First handler claims success with an empty body; the validator rejects
    // it and the chain moves on.
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "   ")).await;
    engine.register_handler(text_handler("deepseek", 70, "substantive answer")).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_max_retries(0))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);

    let log = engine.diagnostics_log();
    assert_eq!(log.len(), 2);
    assert!(log[0].errors[0].contains("validation"));
}

#[tokio::test]
async fn test_all_handlers_exhausted() {
    let engine = DispatchEngine::default();
    engine.register_handler(failing_handler("gemini", 80, "down")).await;
    engine.register_handler(failing_handler("deepseek", 70, "also down")).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_max_retries(0))
        .await;
    assert!(!result.success);
    assert_eq!(
        result.fallbacks_attempted,
        vec!["gemini".to_string(), "deepseek".to_string()]
    );
    let error = result.error.unwrap();
    assert!(error.contains("also down"));
    assert!(error.contains("gemini"));
    assert!(error.contains("deepseek"));
}

#[tokio::test]
async fn test_fallback_disallowed_stops_after_first_handler() {
    let engine = DispatchEngine::default();
    engine.register_handler(failing_handler("gemini", 80, "down")).await;
    engine.register_handler(text_handler("deepseek", 70, "hello")).await;

    let result = engine
        .execute(
            ExecuteRequest::new("generate", "say hi")
                .with_fallback_allowed(false)
                .with_max_retries(0),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);
    assert_eq!(engine.diagnostics_log().len(), 1);
}

#[tokio::test]
async fn test_retry_within_handler_before_fallback() {
    let engine = DispatchEngine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = HandlerDescriptor::new("flaky", "Flaky", SourceKind::ExternalIntegration, move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if n == 0 {
                Ok(HandlerResponse::fail("transient 503"))
            } else {
                Ok(HandlerResponse::ok(Payload::Text("recovered".to_string())))
            }
        })
    })
    .with_capability("generate")
    .with_priority(50);
    engine.register_handler(flaky).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_max_retries(1))
        .await;
    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.fallbacks_attempted.is_empty());

    let log = engine.diagnostics_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].retries, 1);
    assert_eq!(log[0].errors.len(), 1);
    assert!(log[0].success);
}

#[tokio::test]
async fn test_timeout_is_a_failed_attempt_and_bounded() {
    let engine = DispatchEngine::default();
    let slow = HandlerDescriptor::new("slow", "Slow", SourceKind::AiProvider, |_| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HandlerResponse::ok(Payload::Text("too late".to_string())))
        })
    })
    .with_capability("generate")
    .with_priority(80);
    engine.register_handler(slow).await;
    engine.register_handler(text_handler("deepseek", 70, "prompt answer")).await;

    let started = Instant::now();
    let result = engine
        .execute(
            ExecuteRequest::new("generate", "say hi")
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(0),
        )
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["slow".to_string()]);

    let log = engine.diagnostics_log();
    assert!(log[0].errors[0].contains("timed out"));
}

#[tokio::test]
async fn test_preferred_handler_tried_first() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "from gemini")).await;
    engine.register_handler(text_handler("deepseek", 70, "from deepseek")).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_preferred_handler("deepseek"))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert!(result.fallbacks_attempted.is_empty());
}

#[tokio::test]
async fn test_non_retryable_error_skips_remaining_retries() {
    let engine = DispatchEngine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let misconfigured =
        HandlerDescriptor::new("gemini", "Gemini", SourceKind::AiProvider, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(DispatchError::InvalidConfig("api key not set".to_string())) })
        })
        .with_capability("generate")
        .with_priority(80);
    engine.register_handler(misconfigured).await;
    engine.register_handler(text_handler("deepseek", 70, "hello")).await;

    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_max_retries(2))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);
    // Retrying a misconfigured handler cannot help; one call, no retries.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let log = engine.diagnostics_log();
    assert_eq!(log[0].retries, 0);
    assert!(log[0].errors[0].contains("invalid engine configuration"));
}

#[tokio::test]
async fn test_capability_default_handler_tried_first() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "from gemini")).await;
    engine.register_handler(text_handler("local", 10, "from local")).await;
    engine
        .catalog()
        .set_default_handler("generate", Some("local".to_string()))
        .await
        .unwrap();

    let result = engine.execute(ExecuteRequest::new("generate", "say hi")).await;
    assert_eq!(result.handler_used.as_deref(), Some("local"));
}

#[tokio::test]
async fn test_unresolved_preference_falls_back_to_default_handler() {
    let engine = DispatchEngine::default();
    engine.register_handler(text_handler("gemini", 80, "from gemini")).await;
    engine.register_handler(text_handler("local", 10, "from local")).await;
    engine
        .catalog()
        .set_default_handler("generate", Some("local".to_string()))
        .await
        .unwrap();

    // The preferred handler is not registered, so the configured default
    // keeps its front placement.
    let result = engine
        .execute(ExecuteRequest::new("generate", "say hi").with_preferred_handler("missing"))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("local"));
    assert!(result.fallbacks_attempted.is_empty());
}

#[tokio::test]
async fn test_unavailable_default_is_silently_skipped() {
    let engine = DispatchEngine::default();
    engine
        .register_handler(text_handler("gemini", 80, "from gemini").with_availability(false))
        .await;
    engine.register_handler(text_handler("deepseek", 70, "from deepseek")).await;
    engine
        .catalog()
        .set_default_handler("generate", Some("gemini".to_string()))
        .await
        .unwrap();

    let result = engine.execute(ExecuteRequest::new("generate", "say hi")).await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
}

#[tokio::test]
async fn test_source_event_pump_registers_and_removes_handlers() {
    let engine = Arc::new(DispatchEngine::default());
    let (tx, rx) = mpsc::channel(8);
    let registry = engine.registry().clone();
    let pump = tokio::spawn(async move { registry.drive_source_events(rx).await });

    tx.send(SourceEvent::HandlerAvailable(
        text_handler("tool-search", 40, "tool says hi").with_origin("mcp-server"),
    ))
    .await
    .unwrap();
    tx.send(SourceEvent::SourceDisconnected("mcp-server".to_string()))
        .await
        .unwrap();
    drop(tx);
    pump.await.unwrap();

    assert!(engine.registry().is_empty().await);
}

#[tokio::test]
async fn test_user_capability_with_custom_validator() {
    let engine = DispatchEngine::default();
    engine
        .register_capability(CapabilityDef::new("haiku", "Haiku writing"))
        .await;
    engine.register_validator(
        "haiku",
        caproute::validators::Validator::new("not three lines", |payload| {
            matches!(payload, Payload::Text(text) if text.lines().count() == 3)
        }),
    );
    engine
        .register_handler(
            text_handler("gemini", 80, "just one line").with_capabilities(["haiku"]),
        )
        .await;
    engine
        .register_handler(
            text_handler("deepseek", 70, "line one\nline two\nline three")
                .with_capabilities(["haiku"]),
        )
        .await;

    let result = engine
        .execute(ExecuteRequest::new("haiku", "write one").with_max_retries(0))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);
}

#[tokio::test]
async fn test_structured_helper_validator_on_user_capability() {
    let engine = DispatchEngine::default();
    engine
        .register_capability(CapabilityDef::new("extract", "Entity extraction"))
        .await;
    engine.register_validator("extract", caproute::validators::non_null_structured());

    let null_handler = HandlerDescriptor::new("gemini", "Gemini", SourceKind::AiProvider, |_| {
        Box::pin(async { Ok(HandlerResponse::ok(Payload::Structured(serde_json::Value::Null))) })
    })
    .with_capability("extract")
    .with_priority(80);
    engine.register_handler(null_handler).await;
    let object_handler =
        HandlerDescriptor::new("deepseek", "DeepSeek", SourceKind::AiProvider, |_| {
            Box::pin(async {
                Ok(HandlerResponse::ok(Payload::Structured(
                    serde_json::json!({"entities": ["rust"]}),
                )))
            })
        })
        .with_capability("extract")
        .with_priority(70);
    engine.register_handler(object_handler).await;

    let result = engine
        .execute(ExecuteRequest::new("extract", "rust is a language").with_max_retries(0))
        .await;
    assert!(result.success);
    assert_eq!(result.handler_used.as_deref(), Some("deepseek"));
    assert_eq!(result.fallbacks_attempted, vec!["gemini".to_string()]);
}

#[tokio::test]
async fn test_provider_stats_and_clear() {
    let engine = DispatchEngine::default();
    engine.register_handler(failing_handler("gemini", 80, "down")).await;
    engine.register_handler(text_handler("deepseek", 70, "hello")).await;

    engine
        .execute(ExecuteRequest::new("generate", "one").with_max_retries(0))
        .await;
    engine
        .execute(ExecuteRequest::new("generate", "two").with_max_retries(0))
        .await;

    let stats = engine.provider_stats();
    assert_eq!(stats["gemini"].calls, 2);
    assert_eq!(stats["gemini"].errors, 2);
    assert_eq!(stats["gemini"].success_rate, 0.0);
    assert_eq!(stats["deepseek"].calls, 2);
    assert_eq!(stats["deepseek"].success_rate, 1.0);

    engine.clear_diagnostics();
    assert!(engine.diagnostics_log().is_empty());
    assert!(engine.provider_stats().is_empty());
}

#[tokio::test]
async fn test_config_defaults_flow_into_requests() {
    let config = EngineConfig {
        default_max_retries: 0,
        ..EngineConfig::default()
    };
    let engine = DispatchEngine::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = HandlerDescriptor::new("gemini", "Gemini", SourceKind::AiProvider, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(HandlerResponse::fail("always down")) })
    })
    .with_capability("generate")
    .with_priority(80);
    engine.register_handler(handler).await;

    let result = engine.execute(ExecuteRequest::new("generate", "x")).await;
    assert!(!result.success);
    // default_max_retries = 0 means a single attempt.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
