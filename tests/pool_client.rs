mod common;

use common::{completion, completion_body, config, Reply, ScriptedTransport};
use llmpool::{
    ApiError, CircuitState, ErrorKind, GenerateOptions, KeySelectionStrategy, PoolClient,
    PoolError, RateLimitMode,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready};

fn client(config: llmpool::PoolConfig, transport: &Arc<ScriptedTransport>) -> PoolClient {
    PoolClient::with_transport(config, transport.clone()).unwrap()
}

#[tokio::test]
async fn test_generate_text_success() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("Hello!")));
    let client = client(config(&["key-a"]), &transport);

    let options = GenerateOptions::json().with_system_instructions("Answer in JSON");
    let response = client.generate_text("Say hi", &options).await.unwrap();
    assert_eq!(response.content().as_deref(), Some("Hello!"));

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://llm.test/v1/chat/completions");
    assert_eq!(calls[0].timeout, Duration::from_secs(30));

    let body = calls[0].body.as_ref().unwrap();
    assert_eq!(body["model"], "text-model");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Say hi");
    assert_eq!(body["response_format"], json!({"type": "json_object"}));
    assert_eq!(body["max_tokens"], 8192);

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.keys[0].in_flight, 0);
    assert!(stats.keys[0].avg_latency_ms.is_some());
}

#[tokio::test]
async fn test_generate_from_pdf_sends_file_part() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("{\"score\": 3}")));
    let client = client(config(&["key-a"]), &transport);

    let response = client
        .generate_from_pdf("Extract metrics", b"%PDF-1.4", &GenerateOptions::json())
        .await
        .unwrap();
    assert_eq!(response.json_content().unwrap(), json!({"score": 3}));

    let body = transport.calls()[0].body.clone().unwrap();
    assert_eq!(body["model"], "vision-model");
    let temperature = body["temperature"].as_f64().unwrap();
    assert!((temperature - 0.1).abs() < 1e-6);

    let parts = &body["messages"][0]["content"];
    assert_eq!(parts[0], json!({"type": "text", "text": "Extract metrics"}));
    assert_eq!(parts[1]["type"], "file");
    assert_eq!(
        parts[1]["file"]["file_data"],
        "data:application/pdf;base64,JVBERi0xLjQ="
    );

    let err = client
        .generate_from_pdf("Extract metrics", b"", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_generate_from_image_sends_image_part() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("a chart")));
    let client = client(config(&["key-a"]), &transport);

    client
        .generate_from_image("Describe", &[0xff, 0xd8], "image/jpeg", &GenerateOptions::new())
        .await
        .unwrap();

    let body = transport.calls()[0].body.clone().unwrap();
    assert_eq!(
        body["messages"][0]["content"][1]["image_url"]["url"],
        "data:image/jpeg;base64,/9g="
    );

    let err = client
        .generate_from_image("Describe", &[1, 2], "text/plain", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn test_server_error_fails_over_to_next_key() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", Reply::Error(ApiError::server(502, "bad gateway")))
            .always("key-b", completion("from b")),
    );
    let client = client(config(&["key-a", "key-b"]), &transport);

    let response = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(response.content().as_deref(), Some("from b"));
    assert_eq!(transport.call_keys(), vec!["key-a", "key-b"]);

    let stats = client.stats();
    assert_eq!(stats.keys[0].failures, 1);
    assert_eq!(stats.keys[0].consecutive_failures, 1);
    assert_eq!(stats.keys[0].last_error_code, Some(502));
    assert_eq!(stats.keys[0].circuit_state, CircuitState::Closed);
    assert_eq!(stats.keys[1].successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_recovers_after_cooldown() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .always("key-a", completion("recovered")),
    );
    let mut config = config(&["key-a"]);
    config.max_retries = 0;
    let client = client(config, &transport);

    for _ in 0..5 {
        let err = client
            .generate_text("hi", &GenerateOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::RetriesExhausted { attempts: 1, .. }));
    }
    assert_eq!(client.stats().keys[0].circuit_state, CircuitState::Open);

    // The sixth request is refused without reaching the provider
    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ServiceUnavailable { attempts: 0, .. }));
    assert_eq!(err.status_code(), Some(503));
    assert_eq!(transport.call_count(), 5);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(client.stats().keys[0].circuit_state, CircuitState::HalfOpen);

    let response = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(response.content().as_deref(), Some("recovered"));
    assert_eq!(client.stats().keys[0].circuit_state, CircuitState::Closed);
    assert_eq!(transport.call_count(), 6);
}

#[tokio::test]
async fn test_auth_error_is_not_retried_and_does_not_trip_breaker() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", Reply::Error(ApiError::auth("invalid key")))
            .always("key-b", completion("unused")),
    );
    let mut config = config(&["key-a", "key-b"]);
    config.circuit_failure_threshold = 1;
    let client = client(config, &transport);

    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Api(_)));
    assert_eq!(err.kind(), Some(ErrorKind::Auth));
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(transport.call_keys(), vec!["key-a"]);

    let stats = client.stats();
    assert_eq!(stats.keys[0].circuit_state, CircuitState::Closed);
    assert_eq!(stats.keys[0].failures, 1);
}

#[tokio::test]
async fn test_validation_error_surfaces_immediately() {
    let transport = Arc::new(ScriptedTransport::new().always(
        "key-a",
        Reply::Error(ApiError::from_status(400, "messages must not be empty", None)),
    ));
    let client = client(config(&["key-a", "key-b"]), &transport);

    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_all_circuits_open_is_service_unavailable_without_calls() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", Reply::Error(ApiError::connection("refused")))
            .always("key-b", Reply::Error(ApiError::timeout("slow"))),
    );
    let mut config = config(&["key-a", "key-b"]);
    config.circuit_failure_threshold = 1;
    config.max_retries = 1;
    let client = client(config, &transport);

    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(client.stats().open_circuits, 2);

    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    match err {
        PoolError::ServiceUnavailable {
            attempts,
            keys_tried,
            ..
        } => {
            assert_eq!(attempts, 0);
            assert!(keys_tried.is_empty());
        }
        other => panic!("expected ServiceUnavailable, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_embeddings_returned_in_request_order() {
    let transport = Arc::new(ScriptedTransport::new().always(
        "key-a",
        Reply::Json(json!({
            "data": [
                {"embedding": [1.0, 1.0], "index": 1},
                {"embedding": [2.0, 2.0], "index": 2},
                {"embedding": [0.0, 0.0], "index": 0}
            ],
            "model": "embed-model",
            "usage": {"prompt_tokens": 6, "total_tokens": 6}
        })),
    ));
    let client = client(config(&["key-a"]), &transport);

    let texts = vec!["zero".to_string(), "one".to_string(), "two".to_string()];
    let vectors = client.create_embedding(&texts).await.unwrap();
    assert_eq!(
        vectors,
        vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]
    );

    let call = &transport.calls()[0];
    assert_eq!(call.url, "http://llm.test/v1/embeddings");
    assert_eq!(
        call.body.clone().unwrap(),
        json!({"model": "embed-model", "input": ["zero", "one", "two"]})
    );

    assert!(client.create_embedding(&[]).await.unwrap().is_empty());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_key_is_cooled_down() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .then(
                "key-a",
                Reply::Error(ApiError::rate_limited(
                    "Rate limit exceeded",
                    Some(Duration::from_secs(20)),
                )),
            )
            .always("key-a", completion("from a"))
            .always("key-b", completion("from b")),
    );
    let client = client(config(&["key-a", "key-b"]), &transport);

    let response = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(response.content().as_deref(), Some("from b"));

    let stats = client.stats();
    assert!(stats.keys[0].rate_limited_for_ms.unwrap() > 19_000);
    assert_eq!(stats.keys[0].circuit_state, CircuitState::Closed);
    assert_eq!(stats.rate_limited_keys, 1);

    // While cooling down only key-b is used
    client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(transport.call_keys(), vec!["key-a", "key-b", "key-b"]);

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(client.stats().rate_limited_keys, 0);
}

#[tokio::test(start_paused = true)]
async fn test_token_bucket_backpressure() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("ok")));
    let mut config = config(&["key-a"]);
    config.qps_per_key = 2.0;
    config.burst_multiplier = 1.0;
    let client = client(config, &transport);
    let options = GenerateOptions::new();

    let start = Instant::now();
    client.generate_text("1", &options).await.unwrap();
    client.generate_text("2", &options).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);

    // Bucket is empty: the third request waits for the next token
    let mut third = tokio_test::task::spawn(client.generate_text("3", &options));
    assert_pending!(third.poll());
    assert_eq!(transport.call_count(), 2);

    tokio::time::advance(Duration::from_millis(400)).await;
    assert_pending!(third.poll());

    tokio::time::advance(Duration::from_millis(200)).await;
    let response = assert_ready!(third.poll()).unwrap();
    assert_eq!(response.content().as_deref(), Some("ok"));
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn test_reject_mode_fails_fast_when_throttled() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("ok")));
    let mut config = config(&["key-a"]);
    config.qps_per_key = 0.5;
    config.burst_multiplier = 1.0;
    config.rate_limit_mode = RateLimitMode::Reject;
    let client = client(config, &transport);

    client
        .generate_text("1", &GenerateOptions::new())
        .await
        .unwrap();
    let err = client
        .generate_text("2", &GenerateOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_service_unavailable());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_key_waits_within_deadline() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("ok")));
    let mut config = config(&["key-a"]);
    config.qps_per_key = 0.2;
    config.burst_multiplier = 1.0;
    config.request_deadline_s = 10.0;
    let client = client(config, &transport);
    let options = GenerateOptions::new();

    client.generate_text("1", &options).await.unwrap();

    let start = Instant::now();
    client.generate_text("2", &options).await.unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(5), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(6), "waited {:?}", waited);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_key_past_deadline_fails_fast() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("ok")));
    let mut config = config(&["key-a"]);
    config.qps_per_key = 0.01;
    config.burst_multiplier = 1.0;
    config.request_deadline_s = 10.0;
    let client = client(config, &transport);
    let options = GenerateOptions::new();

    client.generate_text("1", &options).await.unwrap();

    let start = Instant::now();
    let err = client.generate_text("2", &options).await.unwrap_err();
    assert_eq!(start.elapsed(), Duration::ZERO);
    match err {
        PoolError::ServiceUnavailable {
            reason, attempts, ..
        } => {
            assert!(reason.contains("deadline"), "reason: {}", reason);
            assert_eq!(attempts, 0);
        }
        other => panic!("expected ServiceUnavailable, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overloaded_retries_without_cooldown_or_breaker_change() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .then(
                "key-a",
                Reply::Error(ApiError::from_status(429, "Upstream provider overloaded", None)),
            )
            .always("key-a", completion("from a"))
            .always("key-b", completion("from b")),
    );
    let mut config = config(&["key-a", "key-b"]);
    config.circuit_failure_threshold = 1;
    let client = client(config, &transport);

    let response = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(response.content().as_deref(), Some("from b"));
    assert_eq!(transport.call_keys(), vec!["key-a", "key-b"]);

    let stats = client.stats();
    assert_eq!(stats.rate_limited_keys, 0);
    assert_eq!(stats.open_circuits, 0);
    assert_eq!(stats.keys[0].rate_limited_for_ms, None);
    assert_eq!(stats.keys[0].circuit_state, CircuitState::Closed);
    assert_eq!(stats.keys[0].failures, 1);
    assert_eq!(stats.keys[0].last_error_code, Some(429));

    // key-a stays in rotation straight away
    let response = client
        .generate_text("again", &GenerateOptions::new())
        .await
        .unwrap();
    assert_eq!(response.content().as_deref(), Some("from a"));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_attempts_and_keys() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", Reply::Error(ApiError::server(503, "unavailable")))
            .always("key-b", Reply::Error(ApiError::server(500, "boom"))),
    );
    let mut config = config(&["key-a", "key-b"]);
    config.circuit_failure_threshold = 10;
    let client = client(config, &transport);

    let err = client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .unwrap_err();
    match err {
        PoolError::RetriesExhausted {
            attempts,
            keys_tried,
            last_error,
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(keys_tried, vec!["…ey-a", "…ey-b"]);
            assert_eq!(last_error.kind, ErrorKind::Server);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 4);
    assert_eq!(client.stats().total_failures, 4);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_counts_as_failure() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", Reply::Hang)
            .always("key-b", completion("fast")),
    );
    let mut config = config(&["key-a", "key-b"]);
    config.circuit_failure_threshold = 1;
    let client = client(config, &transport);

    let start = Instant::now();
    let options = GenerateOptions::new().with_timeout(Duration::from_secs(2));
    let response = client.generate_text("hi", &options).await.unwrap();
    assert_eq!(response.content().as_deref(), Some("fast"));
    assert!(start.elapsed() >= Duration::from_secs(2));

    let stats = client.stats();
    assert_eq!(stats.keys[0].circuit_state, CircuitState::Open);
    assert_eq!(stats.keys[0].in_flight, 0);
    assert_eq!(transport.calls()[0].timeout, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_single_probe() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .then("key-a", Reply::Error(ApiError::server(500, "boom")))
            .always(
                "key-a",
                Reply::Delayed(Duration::from_secs(1), completion_body("probe ok")),
            ),
    );
    let mut config = config(&["key-a"]);
    config.circuit_failure_threshold = 1;
    config.max_retries = 0;
    let client = client(config, &transport);

    assert!(client
        .generate_text("hi", &GenerateOptions::new())
        .await
        .is_err());
    tokio::time::advance(Duration::from_secs(30)).await;

    let options = GenerateOptions::new();
    let (first, second) = tokio::join!(
        client.generate_text("probe", &options),
        client.generate_text("waiter", &options),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());

    // The waiter only went out after the probe closed the circuit
    assert_eq!(transport.max_concurrent(), 1);
    assert_eq!(transport.call_count(), 3);
    assert_eq!(client.stats().keys[0].circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_least_used_strategy_spreads_load() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .always("key-a", completion("a"))
            .always("key-b", completion("b"))
            .always("key-c", completion("c")),
    );
    let mut config = config(&["key-a", "key-b", "key-c"]);
    config.strategy = KeySelectionStrategy::LeastUsed;
    let client = client(config, &transport);

    for _ in 0..6 {
        client
            .generate_text("hi", &GenerateOptions::new())
            .await
            .unwrap();
    }

    let stats = client.stats();
    assert!(stats.keys.iter().all(|k| k.requests == 2), "{:?}", stats.keys);
}

#[test]
fn test_construction_fails_without_keys() {
    let transport = Arc::new(ScriptedTransport::new());
    let err = PoolClient::with_transport(config(&[]), transport).unwrap_err();
    assert!(matches!(err, PoolError::Config(_)));
}

#[tokio::test]
async fn test_construction_rejects_unreachable_rate() {
    let transport = Arc::new(ScriptedTransport::new().always("key-a", completion("ok")));
    let mut config = config(&["key-a"]);
    config.qps_per_key = 1e-300;

    let err = PoolClient::with_transport(config, transport.clone()).unwrap_err();
    assert!(matches!(err, PoolError::Config(_)));
    assert_eq!(transport.call_count(), 0);
}
