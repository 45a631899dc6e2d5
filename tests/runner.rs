mod common;

use std::time::Duration;

use serde_json::json;

use common::fixtures::{
    conditional_edge, minimal_flowchart, node, solid_edge, workspace_rig,
};
use llmctl_engine::model::Flowchart;
use llmctl_engine::runtimes::trace::{TraceQuery, run_status, run_trace};
use llmctl_engine::runtimes::{ControlAction, RunStore, RunnerError};
use llmctl_engine::tooling::ToolCallError;
use llmctl_engine::types::{NodeType, RunStatus};

// ---------------------------------------------------------------------------
// S1: minimal run over the workspace provider
// ---------------------------------------------------------------------------

#[tokio::test]
async fn minimal_run_records_node_runs_with_workspace_metadata() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();

    let run = rig.runner.submit_run(flowchart.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let node_runs = rig.store.node_runs(run.id).await.unwrap();
    assert_eq!(node_runs.len(), 2);
    for node_run in &node_runs {
        assert_eq!(node_run.status, "succeeded");
        assert_eq!(node_run.selected_provider.as_deref(), Some("workspace"));
        assert_eq!(node_run.final_provider.as_deref(), Some("workspace"));
        assert_eq!(node_run.dispatch_status.as_deref(), Some("dispatch_confirmed"));
        assert!(!node_run.fallback_attempted);
        let dispatch_id = node_run.provider_dispatch_id.as_deref().unwrap();
        assert_eq!(dispatch_id, format!("workspace:workspace-{}", node_run.id));
    }

    let artifacts = rig.store.artifacts(run.id).await.unwrap();
    assert_eq!(artifacts.len(), 2);
    for artifact in &artifacts {
        assert!(artifact.payload["routing_state"].is_object());
    }

    let stored = rig.store.run(run.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// S3: decision routing
// ---------------------------------------------------------------------------

fn decision_flowchart() -> Flowchart {
    Flowchart {
        id: 0,
        name: "decision-routing".into(),
        nodes: vec![
            node(1, NodeType::Start, json!({})),
            node(
                2,
                NodeType::Decision,
                json!({"decision_conditions": [
                    {"connector_id": "e-approve", "condition_text": "latest_upstream.node_id == 1"},
                    {"connector_id": "e-reject", "condition_text": "latest_upstream.node_id == 999"},
                ]}),
            ),
            node(3, NodeType::End, json!({})),
            node(4, NodeType::End, json!({})),
        ],
        edges: vec![
            solid_edge("e1", 1, 2),
            solid_edge("e-approve", 2, 3),
            solid_edge("e-reject", 2, 4),
        ],
    }
}

#[tokio::test]
async fn decision_routing_visits_only_matched_connectors() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(decision_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let node_runs = rig.store.node_runs(run.id).await.unwrap();
    let visited: Vec<i64> = node_runs.iter().map(|nr| nr.flowchart_node_id).collect();
    assert!(visited.contains(&3), "approve branch should execute");
    assert!(!visited.contains(&4), "reject branch must not execute");

    let artifacts = rig.store.artifacts(run.id).await.unwrap();
    let decision_artifact = artifacts
        .iter()
        .find(|artifact| artifact.flowchart_node_id == 2)
        .unwrap();
    let evaluations = decision_artifact.payload["evaluations"].as_array().unwrap();
    for evaluation in evaluations {
        let matched = evaluation["matched"].as_bool().unwrap();
        if evaluation["connector_id"] == "e-approve" {
            assert!(matched);
        } else {
            assert!(!matched);
        }
    }
}

#[tokio::test]
async fn decision_no_match_terminates_the_branch() {
    let rig = workspace_rig();
    let mut flowchart = decision_flowchart();
    // Neither condition can match the start output.
    flowchart.nodes[1].config = json!({"decision_conditions": [
        {"connector_id": "e-approve", "condition_text": "latest_upstream.node_id == 998"},
        {"connector_id": "e-reject", "condition_text": "latest_upstream.node_id == 999"},
    ]});
    let flowchart = rig.store.create_flowchart(flowchart).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let node_runs = rig.store.node_runs(run.id).await.unwrap();
    let visited: Vec<i64> = node_runs.iter().map(|nr| nr.flowchart_node_id).collect();
    assert_eq!(visited, vec![1, 2], "no end node may execute on no_match");
}

// ---------------------------------------------------------------------------
// Control: pause/resume/cancel/retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let pause = rig.runner.control(run.id, ControlAction::Pause, None).await.unwrap();
    assert!(pause.updated);
    assert!(!pause.idempotent);
    assert_eq!(pause.run.status, RunStatus::Paused);

    let pause_again = rig.runner.control(run.id, ControlAction::Pause, None).await.unwrap();
    assert!(!pause_again.updated);
    assert!(pause_again.idempotent);

    let resume = rig.runner.control(run.id, ControlAction::Resume, None).await.unwrap();
    assert!(resume.updated);
    assert_eq!(resume.run.status, RunStatus::Running);

    let resume_again = rig.runner.control(run.id, ControlAction::Resume, None).await.unwrap();
    assert!(!resume_again.updated);
    assert!(resume_again.idempotent);
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminal() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let cancel = rig.runner.control(run.id, ControlAction::Cancel, None).await.unwrap();
    assert!(cancel.updated);
    assert_eq!(cancel.run.status, RunStatus::Cancelled);

    let cancel_again = rig.runner.control(run.id, ControlAction::Cancel, None).await.unwrap();
    assert!(!cancel_again.updated);
    assert!(cancel_again.idempotent);

    // A cancelled run stays cancelled through the run loop.
    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Cancelled);
}

#[tokio::test]
async fn retry_with_same_key_returns_the_same_replay_run() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();
    rig.store.set_run_status(run.id, RunStatus::Failed).await.unwrap();

    let first = rig
        .runner
        .control(run.id, ControlAction::Retry, Some("retry-k1"))
        .await
        .unwrap();
    assert_eq!(first.applied_action, "replay_queued");
    assert!(first.updated);
    let replay_id = first.replay_run.as_ref().unwrap().id;
    assert!(replay_id > 0);
    assert_ne!(replay_id, run.id);

    let second = rig
        .runner
        .control(run.id, ControlAction::Retry, Some("retry-k1"))
        .await
        .unwrap();
    assert_eq!(second.applied_action, "replay_existing");
    assert!(second.idempotent);
    assert_eq!(second.replay_run.as_ref().unwrap().id, replay_id);

    // A different key enqueues a different replay.
    let third = rig
        .runner
        .control(run.id, ControlAction::Retry, Some("retry-k2"))
        .await
        .unwrap();
    assert_ne!(third.replay_run.as_ref().unwrap().id, replay_id);
}

#[tokio::test]
async fn retry_without_key_is_rejected() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let err = rig.runner.control(run.id, ControlAction::Retry, None).await.unwrap_err();
    assert!(matches!(err, RunnerError::MissingIdempotencyKey));
}

// ---------------------------------------------------------------------------
// Degraded runs: memory fallback end-to-end, trace & status
// ---------------------------------------------------------------------------

fn memory_flowchart() -> Flowchart {
    Flowchart {
        id: 0,
        name: "memory".into(),
        nodes: vec![
            node(1, NodeType::Start, json!({})),
            node(
                2,
                NodeType::Memory,
                json!({
                    "action": "retrieve",
                    "mode": "deterministic",
                    "retry_count": 0,
                    "fallback_enabled": true,
                }),
            ),
            node(3, NodeType::End, json!({})),
        ],
        edges: vec![solid_edge("e1", 1, 2), solid_edge("e2", 2, 3)],
    }
}

#[tokio::test]
async fn memory_fallback_marks_the_node_run_degraded() {
    let rig = workspace_rig();
    rig.memory
        .failures
        .lock()
        .push(ToolCallError::msg("primary mode crashed"));
    rig.memory
        .retrieved
        .lock()
        .push(json!({"id": 1, "description": "match"}));
    rig.model
        .push_response(r#"{"text": "remember", "store_mode": "replace", "confidence": 1.0}"#);

    let flowchart = rig.store.create_flowchart(memory_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();
    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let node_runs = rig.store.node_runs(run.id).await.unwrap();
    let memory_run = node_runs
        .iter()
        .find(|nr| nr.flowchart_node_id == 2)
        .unwrap();
    assert!(memory_run.degraded_status);
    assert_eq!(memory_run.degraded_reason.as_deref(), Some("primary_runtime_error"));
    assert_eq!(memory_run.output_state["failed_mode"], "deterministic");

    // Status rolls the warning up.
    let status_payload = run_status(rig.store.as_ref(), run.id).await.unwrap();
    assert_eq!(status_payload["state"], "succeeded");
    assert_eq!(status_payload["warning_count"], 1);
    assert_eq!(
        status_payload["warnings"][0]["message"],
        "primary_runtime_error"
    );

    // Trace filters to degraded entries and carries the timeline warning.
    let trace = run_trace(
        rig.store.as_ref(),
        run.id,
        &TraceQuery {
            degraded_only: true,
            ..TraceQuery::default()
        },
    )
    .await
    .unwrap();
    let node_items = trace["node_trace"]["items"].as_array().unwrap();
    assert_eq!(node_items.len(), 1);
    assert_eq!(node_items[0]["node_id"], 2);
    let tool_items = trace["tool_trace"]["items"].as_array().unwrap();
    assert_eq!(tool_items.len(), 1);
    assert_eq!(tool_items[0]["tool_name"], "deterministic.memory");
    let timeline = trace["timeline"]["items"].as_array().unwrap();
    assert!(
        timeline
            .iter()
            .any(|item| item["event_type"] == "flowchart_warning")
    );
}

#[tokio::test]
async fn failing_node_fails_the_run() {
    let rig = workspace_rig();
    rig.memory
        .failures
        .lock()
        .push(ToolCallError::msg("primary mode crashed"));
    // No fallback: the memory node error becomes a node failure.
    let mut flowchart = memory_flowchart();
    flowchart.nodes[1].config = json!({
        "action": "retrieve",
        "mode": "deterministic",
        "retry_count": 0,
        "fallback_enabled": false,
    });
    let flowchart = rig.store.create_flowchart(flowchart).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let node_runs = rig.store.node_runs(run.id).await.unwrap();
    let memory_run = node_runs
        .iter()
        .find(|nr| nr.flowchart_node_id == 2)
        .unwrap();
    assert_eq!(memory_run.status, "failed");
    // The end node never executes past a hard failure.
    assert!(!node_runs.iter().any(|nr| nr.flowchart_node_id == 3));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_events_are_canonical_and_sequenced() {
    let rig = workspace_rig();
    let flowchart = rig.store.create_flowchart(minimal_flowchart()).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();
    rig.runner.execute_run(run.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let events = rig.sink.snapshot();
    assert!(!events.is_empty());

    let stream = format!("flowchart_run:{}", run.id);
    let mut sequences: Vec<u64> = events
        .iter()
        .map(|event| event.envelope.as_ref())
        .filter(|envelope| envelope.sequence_stream == stream)
        .map(|envelope| envelope.sequence)
        .collect();
    sequences.dedup();
    assert!(!sequences.is_empty());
    for window in sequences.windows(2) {
        assert!(window[0] < window[1], "sequences must be strictly increasing");
    }

    let types: Vec<String> = events
        .iter()
        .map(|event| event.envelope.event_type.clone())
        .collect();
    assert!(types.iter().any(|t| t == "flowchart:run:updated"));
    assert!(types.iter().any(|t| t == "node:start:completed"));
    assert!(types.iter().any(|t| t == "node:end:completed"));
    for event in &events {
        let envelope = event.envelope.as_ref();
        assert_eq!(envelope.contract_version, "v1");
        assert_eq!(envelope.event_id, envelope.idempotency_key);
        assert_eq!(
            envelope.payload["correlation_id"],
            format!("flowchart-run-{}", run.id)
        );
    }
}

#[tokio::test]
async fn condition_key_routing_follows_legacy_route_key() {
    let rig = workspace_rig();
    let flowchart = Flowchart {
        id: 0,
        name: "legacy-route".into(),
        nodes: vec![
            node(1, NodeType::Start, json!({})),
            node(
                2,
                NodeType::Decision,
                json!({"route_field_path": "latest_upstream.output_state.node_type"}),
            ),
            node(3, NodeType::End, json!({})),
            node(4, NodeType::End, json!({})),
        ],
        edges: vec![
            solid_edge("e1", 1, 2),
            // Start output_state.node_type is "start": only e-start matches.
            conditional_edge("e-start", 2, 3, "start"),
            conditional_edge("e-other", 2, 4, "other"),
        ],
    };
    let flowchart = rig.store.create_flowchart(flowchart).await.unwrap();
    let run = rig.runner.submit_run(flowchart.id).await.unwrap();

    let status = rig.runner.execute_run(run.id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let visited: Vec<i64> = rig
        .store
        .node_runs(run.id)
        .await
        .unwrap()
        .iter()
        .map(|nr| nr.flowchart_node_id)
        .collect();
    assert!(visited.contains(&3));
    assert!(!visited.contains(&4));
}
