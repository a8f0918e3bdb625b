mod common;

use common::{actions, harness, harness_with_config, DAY};
use idempotency_engine::audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink};
use idempotency_engine::engine::{EngineConfig, ExecuteOptions};
use idempotency_engine::error::{EngineError, Result};
use idempotency_engine::fingerprint::fingerprint;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[tokio::test]
async fn test_duplicate_call_returns_memoized_result() {
    let h = harness();
    let fp = fingerprint(&json!({"amount": 100}));
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let result: Value = h
            .engine
            .execute(
                "k1",
                &fp,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"success": true}))
                },
                ExecuteOptions::default(),
            )
            .await
            .expect("execute should succeed");
        assert_eq!(result, json!({"success": true}));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "handler must run once");
    assert_eq!(
        h.sink.actions(),
        vec![
            AuditAction::Acquired,
            AuditAction::Stored,
            AuditAction::LockReleased,
            AuditAction::Hit,
        ]
    );
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_rejected_without_running_handler() {
    let h = harness();
    let committed_fp = fingerprint(&json!({"amount": 100}));
    let replayed_fp = fingerprint(&json!({"amount": 200}));

    let _: Value = h
        .engine
        .execute(
            "k2",
            &committed_fp,
            || async { Ok(json!({"success": true})) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = Arc::clone(&calls);
    let err = h
        .engine
        .execute::<Value, _, _>(
            "k2",
            &replayed_fp,
            move || async move {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"success": false}))
            },
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::FingerprintMismatch { stored_fingerprint } => {
            assert_eq!(stored_fingerprint, committed_fp);
        }
        other => panic!("expected FingerprintMismatch, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let events = h.sink.events();
    let mismatch_events: Vec<&AuditEvent> = events
        .iter()
        .filter(|event| event.action == AuditAction::FingerprintMismatch)
        .collect();
    assert_eq!(mismatch_events.len(), 1);
    assert_eq!(
        mismatch_events[0].fingerprint.as_deref(),
        Some(replayed_fp.as_str())
    );
    assert_eq!(
        mismatch_events[0].stored_fingerprint.as_deref(),
        Some(committed_fp.as_str())
    );
}

#[tokio::test]
async fn test_concurrent_caller_sees_operation_in_progress() {
    let h = harness_with_config(EngineConfig::new(Duration::from_secs(5), DAY));
    let engine = Arc::new(h.engine);
    let fp = fingerprint(&json!({"amount": 100}));

    let slow_engine = Arc::clone(&engine);
    let slow_fp = fp.clone();
    let slow = tokio::spawn(async move {
        slow_engine
            .execute(
                "k3",
                &slow_fp,
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!({"settled": true}))
                },
                ExecuteOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = engine
        .execute::<Value, _, _>(
            "k3",
            &fp,
            || async { Ok(json!({"settled": false})) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OperationInProgress));

    let result: Value = slow.await.unwrap().unwrap();
    assert_eq!(result, json!({"settled": true}));
}

#[tokio::test]
async fn test_handler_timeout_then_fresh_retry() {
    let h = harness();
    let fp = fingerprint(&json!({"amount": 100}));

    let err = h
        .engine
        .execute::<Value, _, _>(
            "k4",
            &fp,
            || std::future::pending(),
            ExecuteOptions::new().with_handler_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HandlerTimeout { timeout_ms: 50 }));

    assert_eq!(
        h.sink.actions(),
        vec![
            AuditAction::Acquired,
            AuditAction::Timeout,
            AuditAction::LockReleased,
        ]
    );

    // Past the lock TTL nothing was committed, so the retry starts fresh.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result: Value = h
        .engine
        .execute(
            "k4",
            &fp,
            || async { Ok(json!({"success": true})) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"success": true}));
    assert!(h.sink.actions().contains(&AuditAction::Stored));
}

#[tokio::test]
async fn test_key_prefix_applies_to_every_audit_event() {
    let h = harness_with_config(
        EngineConfig::new(Duration::from_millis(200), DAY).with_key_prefix("test-prefix:"),
    );
    let fp = fingerprint(&json!({"amount": 1}));

    let _: Value = h
        .engine
        .execute(
            "my-key",
            &fp,
            || async { Ok(json!(1)) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let events = h.sink.events();
    assert!(!events.is_empty());
    for event in &events {
        assert_eq!(event.key, "test-prefix:my-key");
    }
}

#[tokio::test]
async fn test_exactly_once_under_concurrency() {
    let h = harness_with_config(EngineConfig::new(Duration::from_secs(5), DAY));
    let engine = Arc::new(h.engine);
    let fp = fingerprint(&json!({"amount": 100}));
    let calls = Arc::new(AtomicU32::new(0));

    let mut joins = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let fp = fp.clone();
        let calls = Arc::clone(&calls);
        joins.push(tokio::spawn(async move {
            engine
                .execute::<Value, _, _>(
                    "k-conc",
                    &fp,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"receipt": "r-1"}))
                    },
                    ExecuteOptions::default(),
                )
                .await
        }));
    }

    let mut successes = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(result) => {
                successes += 1;
                assert_eq!(result, json!({"receipt": "r-1"}));
            }
            Err(EngineError::OperationInProgress) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "handler must run once");
    assert!(successes >= 1);
}

#[tokio::test]
async fn test_invalid_keys_are_rejected_before_any_audit() {
    let h = harness();
    let fp = fingerprint(&json!(1));

    for key in ["", "   ", "\t\n"] {
        let err = h
            .engine
            .execute::<Value, _, _>(
                key,
                &fp,
                || async { Ok(json!(1)) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidKey));
    }

    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_keys_are_trimmed_before_namespacing() {
    let h = harness_with_config(
        EngineConfig::new(Duration::from_millis(200), DAY).with_key_prefix("orders:"),
    );
    let fp = fingerprint(&json!(1));

    let _: Value = h
        .engine
        .execute(
            "  k7  ",
            &fp,
            || async { Ok(json!(1)) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(h.sink.events()[0].key, "orders:k7");
}

#[tokio::test]
async fn test_per_call_bounds_are_validated() {
    let h = harness();
    let fp = fingerprint(&json!(1));
    let calls = Arc::new(AtomicU32::new(0));

    for timeout in [Duration::from_millis(49), Duration::from_millis(300_001)] {
        let calls = Arc::clone(&calls);
        let err = h
            .engine
            .execute::<Value, _, _>(
                "k8",
                &fp,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                },
                ExecuteOptions::new().with_handler_timeout(timeout),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    let short_retention = Arc::clone(&calls);
    let err = h
        .engine
        .execute::<Value, _, _>(
            "k8",
            &fp,
            move || async move {
                short_retention.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            },
            ExecuteOptions::new().with_retention_override(Duration::from_millis(1000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRetention { .. }));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_sensitive_metadata_never_reaches_the_sink() {
    let h = harness();
    let fp = fingerprint(&json!({"amount": 100}));

    let call_metadata = metadata(json!({
        "order_id": "ord-1",
        "password": "hunter2",
        "cardNumber": "4111111111111111",
        "customer_email": "a@example.com",
        "fullName": "Jo Doe",
        "phone": "555-0100",
    }));

    let _: Value = h
        .engine
        .execute(
            "k9",
            &fp,
            || async { Ok(json!(1)) },
            ExecuteOptions::new().with_metadata(call_metadata),
        )
        .await
        .unwrap();

    let events = h.sink.events();
    assert!(!events.is_empty());
    for event in &events {
        assert_eq!(event.metadata.len(), 1, "only order_id survives");
        assert!(event.metadata.contains_key("order_id"));
    }

    // The store's persisted copy is the same redacted event.
    for event in h.store.audit_events() {
        assert!(!event.metadata.contains_key("password"));
        assert!(!event.metadata.contains_key("cardNumber"));
    }
}

#[tokio::test]
async fn test_per_call_sink_override_replaces_engine_sink() {
    let h = harness();
    let fp = fingerprint(&json!(1));
    let override_sink = Arc::new(MemoryAuditSink::new());

    let _: Value = h
        .engine
        .execute(
            "k10",
            &fp,
            || async { Ok(json!(1)) },
            ExecuteOptions::new().with_on_audit(override_sink.clone()),
        )
        .await
        .unwrap();

    assert!(h.sink.events().is_empty(), "engine sink must be bypassed");
    assert_eq!(
        override_sink.actions(),
        vec![
            AuditAction::Acquired,
            AuditAction::Stored,
            AuditAction::LockReleased,
        ]
    );
}

struct FailingSink;

#[async_trait::async_trait]
impl AuditSink for FailingSink {
    async fn emit(&self, _event: &AuditEvent) -> Result<()> {
        Err(EngineError::Internal(anyhow::anyhow!("sink unavailable")))
    }
}

#[tokio::test]
async fn test_failing_audit_sink_never_affects_business_logic() {
    let h = harness();
    let fp = fingerprint(&json!(1));

    let result: Value = h
        .engine
        .execute(
            "k11",
            &fp,
            || async { Ok(json!({"success": true})) },
            ExecuteOptions::new().with_on_audit(Arc::new(FailingSink)),
        )
        .await
        .expect("a broken sink must not fail the call");
    assert_eq!(result, json!({"success": true}));
}

#[tokio::test]
async fn test_handler_failure_propagates_after_error_audit() {
    let h = harness();
    let fp = fingerprint(&json!(1));

    let err = h
        .engine
        .execute::<Value, _, _>(
            "k12",
            &fp,
            || async { Err(EngineError::Internal(anyhow::anyhow!("downstream refused"))) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INTERNAL_ERROR");
    assert!(err.to_string().contains("downstream refused"));

    assert_eq!(
        h.sink.actions(),
        vec![
            AuditAction::Acquired,
            AuditAction::Error,
            AuditAction::LockReleased,
        ]
    );

    let events = h.sink.events();
    let error_event = events
        .iter()
        .find(|event| event.action == AuditAction::Error)
        .unwrap();
    assert_eq!(
        error_event.metadata.get("error_code"),
        Some(&json!("INTERNAL_ERROR"))
    );
    assert!(error_event.metadata.get("error").is_some());

    // Nothing was committed, so the key is retryable.
    let result: Value = h
        .engine
        .execute(
            "k12",
            &fp,
            || async { Ok(json!({"success": true})) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"success": true}));
}

#[tokio::test]
async fn test_timeout_audit_carries_error_code() {
    let h = harness();
    let fp = fingerprint(&json!(1));

    let _ = h
        .engine
        .execute::<Value, _, _>(
            "k13",
            &fp,
            || std::future::pending(),
            ExecuteOptions::new().with_handler_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    let events = h.sink.events();
    let timeout_event = events
        .iter()
        .find(|event| event.action == AuditAction::Timeout)
        .unwrap();
    assert_eq!(
        timeout_event.metadata.get("error_code"),
        Some(&json!("HANDLER_TIMEOUT"))
    );
}

#[tokio::test]
async fn test_typed_results_round_trip_through_the_store() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Receipt {
        receipt_id: String,
        amount: u64,
    }

    let h = harness();
    let fp = fingerprint(&json!({"amount": 250}));

    let first: Receipt = h
        .engine
        .execute(
            "k14",
            &fp,
            || async {
                Ok(Receipt {
                    receipt_id: "r-77".to_string(),
                    amount: 250,
                })
            },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let second: Receipt = h
        .engine
        .execute(
            "k14",
            &fp,
            || async { panic!("handler must not run on a hit") },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_store_audit_log_mirrors_the_sink() {
    let h = harness();
    let fp = fingerprint(&json!(1));

    let _: Value = h
        .engine
        .execute(
            "k15",
            &fp,
            || async { Ok(json!(1)) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let sink_actions = h.sink.actions();
    let store_actions = actions(&h.store.audit_events());
    assert_eq!(sink_actions, store_actions);
}
