//! Run trace aggregation and status roll-up.
//!
//! The trace endpoint projects persisted node runs and artifacts into four
//! sections (`node_trace`, `tool_trace`, `artifact_trace`, `timeline`), each
//! shaped `{items: [...]}` and filterable by `degraded_only` and
//! `trace_request_id`. Status rolls degraded node runs up into
//! `{state, warning_count, warnings}`.

use serde_json::{Value, json};

use crate::model::FlowchartRunNode;
use crate::types::RunId;

use super::store::{Result, RunStore};

/// Trace endpoint query parameters.
#[derive(Clone, Debug)]
pub struct TraceQuery {
    /// Sections to include: any of `node`, `tool`, `artifact`, `timeline`.
    pub include: Vec<String>,
    /// Restrict to degraded node runs (and their tools/artifacts).
    pub degraded_only: bool,
    /// Restrict to entries carrying this request id.
    pub trace_request_id: Option<String>,
    /// Per-section item cap.
    pub limit: usize,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            include: vec![
                "node".to_string(),
                "tool".to_string(),
                "artifact".to_string(),
                "timeline".to_string(),
            ],
            degraded_only: false,
            trace_request_id: None,
            limit: 100,
        }
    }
}

impl TraceQuery {
    fn includes(&self, section: &str) -> bool {
        self.include.iter().any(|entry| entry == section)
    }
}

fn node_request_id(node_run: &FlowchartRunNode) -> Option<String> {
    node_run
        .output_state
        .get("request_id")
        .or_else(|| node_run.input_context.get("request_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn node_correlation_id(node_run: &FlowchartRunNode) -> Option<String> {
    node_run
        .output_state
        .get("correlation_id")
        .or_else(|| node_run.input_context.get("correlation_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn node_warnings(node_run: &FlowchartRunNode) -> Vec<Value> {
    let tooling_warnings = node_run
        .output_state
        .pointer("/deterministic_tooling/warnings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !tooling_warnings.is_empty() {
        return tooling_warnings;
    }
    node_run
        .output_state
        .get("warnings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn matches_request_id(candidate: Option<&str>, wanted: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => candidate == Some(wanted),
    }
}

/// Aggregate the trace sections for a run.
pub async fn run_trace(
    store: &dyn RunStore,
    run_id: RunId,
    query: &TraceQuery,
) -> Result<Value> {
    let node_runs = store.node_runs(run_id).await?;
    let artifacts = store.artifacts(run_id).await?;
    let wanted_request_id = query.trace_request_id.as_deref();

    let selected: Vec<&FlowchartRunNode> = node_runs
        .iter()
        .filter(|node_run| !query.degraded_only || node_run.degraded_status)
        .filter(|node_run| {
            matches_request_id(node_request_id(node_run).as_deref(), wanted_request_id)
        })
        .collect();

    let mut trace = serde_json::Map::new();

    if query.includes("node") {
        let items: Vec<Value> = selected
            .iter()
            .take(query.limit)
            .map(|node_run| {
                json!({
                    "node_run_id": node_run.id,
                    "node_id": node_run.flowchart_node_id,
                    "execution_index": node_run.execution_index,
                    "status": node_run.status.clone(),
                    "request_id": node_request_id(node_run),
                    "correlation_id": node_correlation_id(node_run),
                    "degraded_status": node_run.degraded_status,
                    "degraded_reason": node_run.degraded_reason.clone(),
                    "warnings": node_warnings(node_run),
                })
            })
            .collect();
        trace.insert("node_trace".to_string(), json!({"items": items}));
    }

    if query.includes("tool") {
        let items: Vec<Value> = selected
            .iter()
            .filter_map(|node_run| {
                node_run
                    .output_state
                    .get("deterministic_tooling")
                    .map(|tooling| (node_run, tooling))
            })
            .take(query.limit)
            .map(|(node_run, tooling)| {
                json!({
                    "node_run_id": node_run.id,
                    "tool_name": tooling.get("tool_name"),
                    "operation": tooling.get("operation"),
                    "execution_status": tooling.get("execution_status"),
                    "fallback_used": tooling.get("fallback_used"),
                    "attempt_count": tooling.get("attempt_count"),
                    "request_id": tooling.get("request_id").and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| node_request_id(node_run)),
                    "correlation_id": tooling.get("correlation_id").and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| node_correlation_id(node_run)),
                })
            })
            .collect();
        trace.insert("tool_trace".to_string(), json!({"items": items}));
    }

    if query.includes("artifact") {
        let selected_node_runs: Vec<i64> = selected.iter().map(|node_run| node_run.id).collect();
        let items: Vec<Value> = artifacts
            .iter()
            .filter(|artifact| {
                !query.degraded_only || selected_node_runs.contains(&artifact.flowchart_run_node_id)
            })
            .filter(|artifact| {
                matches_request_id(artifact.request_id.as_deref(), wanted_request_id)
            })
            .take(query.limit)
            .map(|artifact| {
                json!({
                    "artifact_id": artifact.id,
                    "node_run_id": artifact.flowchart_run_node_id,
                    "artifact_type": artifact.artifact_type.encode(),
                    "request_id": artifact.request_id.clone(),
                    "correlation_id": artifact.correlation_id.clone(),
                    "variant_key": artifact.variant_key.clone(),
                })
            })
            .collect();
        trace.insert("artifact_trace".to_string(), json!({"items": items}));
    }

    if query.includes("timeline") {
        let items: Vec<Value> = selected
            .iter()
            .filter(|node_run| node_run.degraded_status)
            .take(query.limit)
            .map(|node_run| {
                json!({
                    "event_type": "flowchart_warning",
                    "node_run_id": node_run.id,
                    "node_id": node_run.flowchart_node_id,
                    "message": node_run.degraded_reason.clone(),
                    "at": node_run.created_at,
                })
            })
            .collect();
        trace.insert("timeline".to_string(), json!({"items": items}));
    }

    Ok(Value::Object(trace))
}

/// Roll up run state and warnings for the status endpoint.
pub async fn run_status(store: &dyn RunStore, run_id: RunId) -> Result<Value> {
    let run = store.run(run_id).await?;
    let node_runs = store.node_runs(run_id).await?;
    let warnings: Vec<Value> = node_runs
        .iter()
        .filter(|node_run| node_run.degraded_status)
        .map(|node_run| {
            json!({
                "node_run_id": node_run.id,
                "node_id": node_run.flowchart_node_id,
                "message": node_run.degraded_reason.clone(),
            })
        })
        .collect();
    Ok(json!({
        "state": run.status.encode(),
        "warning_count": warnings.len(),
        "warnings": warnings,
    }))
}
