use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;

use llmctl_engine::tooling::{
    TOOL_STATUS_SUCCESS, TOOL_STATUS_SUCCESS_WITH_WARNING, ToolCallError, ToolFallbackBuilder,
    ToolInvocationConfig, ToolValidate, ToolingError, build_fallback_warning,
    invoke_deterministic_tool,
};
use llmctl_engine::types::NodeType;

#[tokio::test]
async fn success_attaches_trace_and_contract_markers() {
    let config = ToolInvocationConfig::new(NodeType::Memory, "deterministic.memory", "add")
        .with_execution_id(77)
        .with_request_id("req-77")
        .with_correlation_id("corr-77")
        .with_idempotency_key("tooling-test:success:77");
    let validate: ToolValidate = Box::new(|output_state, _routing_state| {
        if output_state.get("node_type") == Some(&json!("memory")) {
            Ok(())
        } else {
            Err(ToolCallError::msg("wrong node type"))
        }
    });

    let outcome = invoke_deterministic_tool(
        config,
        || async {
            Ok((
                json!({"node_type": "memory", "action": "add", "action_results": ["ok"]}),
                json!({}),
            ))
        },
        Some(validate),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.execution_status, TOOL_STATUS_SUCCESS);
    assert!(!outcome.fallback_used);
    assert_eq!(outcome.trace_envelope["tool_name"], "deterministic.memory");
    assert_eq!(outcome.trace_envelope["operation"], "add");
    assert_eq!(outcome.trace_envelope["request_id"], "req-77");
    assert_eq!(outcome.trace_envelope["correlation_id"], "corr-77");
    assert_eq!(outcome.trace_envelope["attempt_count"], 1);
    assert_eq!(outcome.output_state["execution_status"], TOOL_STATUS_SUCCESS);
    assert_eq!(outcome.output_state["fallback_used"], false);
    assert!(outcome.output_state["deterministic_tooling"].is_object());
}

#[tokio::test]
async fn retries_then_succeeds_with_call_trace() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = Arc::clone(&attempts);
    let config = ToolInvocationConfig::new(NodeType::Plan, "deterministic.plan", "create_or_update_plan")
        .with_max_attempts(2);

    let outcome = invoke_deterministic_tool(
        config,
        move || {
            let attempts = Arc::clone(&attempts_in);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ToolCallError::msg("transient failure"))
                } else {
                    Ok((
                        json!({
                            "node_type": "plan",
                            "mode": "create_or_update_plan",
                            "store_mode": "replace",
                            "action_results": [],
                        }),
                        json!({}),
                    ))
                }
            }
        },
        None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.execution_status, TOOL_STATUS_SUCCESS);
    assert_eq!(outcome.trace_envelope["attempt_count"], 2);
    let calls = outcome.trace_envelope["calls"].as_array().unwrap();
    assert_eq!(calls[0]["status"], "failed");
    assert_eq!(calls[1]["status"], "succeeded");
}

#[tokio::test]
async fn exhausted_attempts_use_the_fallback_builder() {
    let config =
        ToolInvocationConfig::new(NodeType::Decision, "deterministic.decision", "evaluate");
    let fallback: ToolFallbackBuilder = Box::new(|error| {
        (
            json!({
                "node_type": "decision",
                "matched_connector_ids": [],
                "evaluations": [],
                "no_match": true,
            }),
            json!({"matched_connector_ids": [], "evaluations": [], "no_match": true}),
            build_fallback_warning(error.message.clone()),
        )
    });

    let outcome = invoke_deterministic_tool(
        config,
        || async { Err(ToolCallError::msg("predicate conflict")) },
        None,
        Some(fallback),
    )
    .await
    .unwrap();

    assert!(outcome.fallback_used);
    assert_eq!(outcome.execution_status, TOOL_STATUS_SUCCESS_WITH_WARNING);
    assert_eq!(
        outcome.output_state["execution_status"],
        TOOL_STATUS_SUCCESS_WITH_WARNING
    );
    assert_eq!(outcome.output_state["fallback_used"], true);
    assert_eq!(outcome.routing_state["fallback_used"], true);
    assert_eq!(outcome.trace_envelope["fallback_used"], true);
    let warnings = outcome.trace_envelope["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(
        warnings[0]["message"]
            .as_str()
            .unwrap()
            .contains("predicate conflict")
    );
}

#[tokio::test]
async fn exhausted_attempts_without_fallback_surface_the_last_error() {
    let config = ToolInvocationConfig::new(NodeType::Memory, "deterministic.memory", "retrieve")
        .with_max_attempts(2);
    let err = invoke_deterministic_tool(
        config,
        || async { Err::<(serde_json::Value, serde_json::Value), _>(ToolCallError::msg("db down")) },
        None,
        None,
    )
    .await
    .unwrap_err();
    match err {
        ToolingError::AttemptsExhausted { attempts, last_error } => {
            assert_eq!(attempts, 2);
            assert_eq!(last_error.message, "db down");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn duplicate_idempotency_key_is_rejected_without_invoking() {
    let key = "tooling-test:duplicate-key";
    let invoked = Arc::new(AtomicU32::new(0));

    let first = invoke_deterministic_tool(
        ToolInvocationConfig::new(NodeType::Memory, "deterministic.memory", "add")
            .with_idempotency_key(key),
        {
            let invoked = Arc::clone(&invoked);
            move || {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok((
                        json!({"node_type": "memory", "action": "add", "action_results": []}),
                        json!({}),
                    ))
                }
            }
        },
        None,
        None,
    )
    .await;
    assert!(first.is_ok());

    let second = invoke_deterministic_tool(
        ToolInvocationConfig::new(NodeType::Memory, "deterministic.memory", "add")
            .with_idempotency_key(key),
        {
            let invoked = Arc::clone(&invoked);
            move || {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok((
                        json!({"node_type": "memory", "action": "add", "action_results": []}),
                        json!({}),
                    ))
                }
            }
        },
        None,
        None,
    )
    .await;

    assert!(matches!(
        second,
        Err(ToolingError::IdempotencyConflict { .. })
    ));
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}
