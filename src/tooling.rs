//! Deterministic tooling framework wrapping special-node handlers.
//!
//! Decision, memory, milestone, and plan handlers run inside
//! [`invoke_deterministic_tool`], which owns retry, validation, fallback, and
//! the tool trace attached to the node output under `deterministic_tooling`.
//!
//! Recoverable failures never escape as errors: an exhausted attempt budget
//! with a fallback builder produces a `success_with_warning` outcome instead.
//! The only error surfaced to the run loop is
//! [`ToolingError::IdempotencyConflict`] (and
//! [`ToolingError::AttemptsExhausted`] when no fallback was supplied, which
//! the node runtime maps onto its own failure semantics).

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::idempotency::register_dispatch_key;
use crate::types::NodeType;
use crate::utils::id_generator::IdGenerator;

/// Execution status of a successful tool invocation.
pub const TOOL_STATUS_SUCCESS: &str = "success";
/// Execution status of an invocation that recovered through its fallback.
pub const TOOL_STATUS_SUCCESS_WITH_WARNING: &str = "success_with_warning";

// ============================================================================
// Scaffolds
// ============================================================================

/// Base tool identity resolved per special node type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolScaffold {
    pub tool_name: &'static str,
    pub operation: String,
    /// Key under which the node runtime extracts the artifact payload.
    pub artifact_hook_key: &'static str,
}

/// Resolve the base scaffold for a special node type.
///
/// Unknown or unsupported operations fall back to the default operation for
/// the type. Non-special node types resolve to a generic passthrough
/// scaffold; callers normally gate on [`NodeType::is_special`] first.
#[must_use]
pub fn resolve_base_tool_scaffold(node_type: NodeType, operation: Option<&str>) -> ToolScaffold {
    let requested = operation.map(str::trim).filter(|op| !op.is_empty());
    let (tool_name, default_op, supported, hook): (&str, &str, &[&str], &str) = match node_type {
        NodeType::Decision => (
            "deterministic.decision",
            "evaluate",
            &["evaluate", "legacy_route"],
            "decision_final_state",
        ),
        NodeType::Memory => (
            "deterministic.memory",
            "add",
            &["add", "retrieve", "delete"],
            "memory_final_state",
        ),
        NodeType::Milestone => (
            "deterministic.milestone",
            "create_or_update",
            &["create_or_update", "mark_complete"],
            "milestone_final_state",
        ),
        NodeType::Plan => (
            "deterministic.plan",
            "create_or_update_plan",
            &["create_or_update_plan", "complete_plan_item"],
            "plan_final_state",
        ),
        _ => ("deterministic.passthrough", "run", &["run"], "final_state"),
    };
    let operation = match requested {
        Some(op) if supported.contains(&op) => op.to_string(),
        _ => default_op.to_string(),
    };
    ToolScaffold {
        tool_name,
        operation,
        artifact_hook_key: hook,
    }
}

// ============================================================================
// Invocation config & outcome
// ============================================================================

/// Configuration for one deterministic tool invocation.
#[derive(Clone, Debug)]
pub struct ToolInvocationConfig {
    pub node_type: NodeType,
    pub tool_name: String,
    pub operation: String,
    pub execution_id: Option<i64>,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Attempt budget; clamped to at least one.
    pub max_attempts: u32,
}

impl ToolInvocationConfig {
    #[must_use]
    pub fn new(node_type: NodeType, tool_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            node_type,
            tool_name: tool_name.into(),
            operation: operation.into(),
            execution_id: None,
            request_id: None,
            correlation_id: None,
            idempotency_key: None,
            max_attempts: 1,
        }
    }

    /// Build a config from the scaffold for `node_type`.
    #[must_use]
    pub fn from_scaffold(node_type: NodeType, operation: Option<&str>) -> Self {
        let scaffold = resolve_base_tool_scaffold(node_type, operation);
        Self::new(node_type, scaffold.tool_name, scaffold.operation)
    }

    #[must_use]
    pub fn with_execution_id(mut self, execution_id: i64) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Failure raised by a user `invoke` or `validate` function.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ToolCallError {
    pub message: String,
    /// Optional classifier consumed by handler-level fallback policies.
    pub kind: Option<String>,
}

impl ToolCallError {
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Advisory warning attached to a fallback outcome.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolWarning {
    pub message: String,
    #[serde(default)]
    pub warning_type: String,
}

/// Build the standard fallback warning.
#[must_use]
pub fn build_fallback_warning(message: impl Into<String>) -> ToolWarning {
    ToolWarning {
        message: message.into(),
        warning_type: "deterministic_tool_fallback".to_string(),
    }
}

/// One attempt in the call trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub attempt: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a deterministic tool invocation.
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub execution_status: &'static str,
    pub fallback_used: bool,
    pub attempt_count: u32,
    pub output_state: Value,
    pub routing_state: Value,
    pub warnings: Vec<ToolWarning>,
    /// `{tool_name, operation, execution_status, attempt_count, calls, ...}`
    pub trace_envelope: Value,
}

/// Errors surfaced to the caller of [`invoke_deterministic_tool`].
#[derive(Debug, Error, Diagnostic)]
pub enum ToolingError {
    /// The supplied idempotency key was already registered; the invocation
    /// did not run.
    #[error("deterministic tool idempotency key already registered: {key}")]
    #[diagnostic(
        code(llmctl_engine::tooling::idempotency),
        help("Each deterministic tool invocation needs a fresh idempotency key.")
    )]
    IdempotencyConflict { key: String },

    /// Every attempt failed and no fallback builder was supplied.
    #[error("deterministic tool failed after {attempts} attempt(s): {last_error}")]
    #[diagnostic(code(llmctl_engine::tooling::exhausted))]
    AttemptsExhausted {
        attempts: u32,
        last_error: ToolCallError,
    },
}

/// Optional validation hook over `(output_state, routing_state)`.
pub type ToolValidate = Box<dyn Fn(&Value, &Value) -> Result<(), ToolCallError> + Send + Sync>;

/// Optional fallback builder consuming the last failure and producing a
/// replacement `(output_state, routing_state, warning)` triple.
pub type ToolFallbackBuilder =
    Box<dyn FnOnce(&ToolCallError) -> (Value, Value, ToolWarning) + Send>;

// ============================================================================
// Invocation
// ============================================================================

fn ensure_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn trace_envelope(
    config: &ToolInvocationConfig,
    request_id: &str,
    correlation_id: &str,
    execution_status: &str,
    fallback_used: bool,
    attempt_count: u32,
    calls: &[ToolCallRecord],
    warnings: &[ToolWarning],
) -> Value {
    json!({
        "tool_name": config.tool_name.clone(),
        "operation": config.operation.clone(),
        "node_type": config.node_type.encode(),
        "execution_id": config.execution_id,
        "request_id": request_id,
        "correlation_id": correlation_id,
        "execution_status": execution_status,
        "fallback_used": fallback_used,
        "attempt_count": attempt_count,
        "calls": calls,
        "warnings": warnings,
        "invoked_at": Utc::now().to_rfc3339(),
    })
}

/// Invoke a deterministic tool with retry, validation, and fallback.
///
/// Runs `invoke` up to `max_attempts` times. Each successful return is passed
/// through `validate` when supplied; a validation failure counts as a failed
/// attempt. On exhaustion, a supplied `fallback_builder` converts the last
/// failure into a `success_with_warning` outcome; without one, the last
/// failure is returned as [`ToolingError::AttemptsExhausted`].
///
/// The resulting trace is merged into `output_state` under
/// `deterministic_tooling`, alongside top-level `execution_status` and
/// `fallback_used` markers (plus `warnings` on the fallback path).
pub async fn invoke_deterministic_tool<F, Fut>(
    config: ToolInvocationConfig,
    mut invoke: F,
    validate: Option<ToolValidate>,
    fallback_builder: Option<ToolFallbackBuilder>,
) -> Result<ToolOutcome, ToolingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(Value, Value), ToolCallError>>,
{
    if let Some(ref key) = config.idempotency_key {
        if !register_dispatch_key(key) {
            return Err(ToolingError::IdempotencyConflict { key: key.clone() });
        }
    }

    let request_id = config
        .request_id
        .clone()
        .unwrap_or_else(|| IdGenerator::new().generate_request_id("tool"));
    let correlation_id = config.correlation_id.clone().unwrap_or_else(|| request_id.clone());

    let max_attempts = config.max_attempts.max(1);
    let mut calls: Vec<ToolCallRecord> = Vec::new();
    let mut last_error: Option<ToolCallError> = None;

    for attempt in 1..=max_attempts {
        let result = invoke().await;
        match result {
            Ok((output_state, routing_state)) => {
                if let Some(ref validator) = validate {
                    if let Err(err) = validator(&output_state, &routing_state) {
                        debug!(
                            target: "llmctl_engine::tooling",
                            tool = %config.tool_name,
                            operation = %config.operation,
                            attempt,
                            reason = %err,
                            "tool validation failed"
                        );
                        calls.push(ToolCallRecord {
                            attempt,
                            status: "failed".into(),
                            reason: Some(err.message.clone()),
                        });
                        last_error = Some(err);
                        continue;
                    }
                }
                calls.push(ToolCallRecord {
                    attempt,
                    status: "succeeded".into(),
                    reason: None,
                });
                let trace = trace_envelope(
                    &config,
                    &request_id,
                    &correlation_id,
                    TOOL_STATUS_SUCCESS,
                    false,
                    attempt,
                    &calls,
                    &[],
                );
                let mut output = ensure_object(output_state);
                output.insert("execution_status".into(), json!(TOOL_STATUS_SUCCESS));
                output.insert("fallback_used".into(), json!(false));
                output.insert("deterministic_tooling".into(), trace.clone());
                return Ok(ToolOutcome {
                    execution_status: TOOL_STATUS_SUCCESS,
                    fallback_used: false,
                    attempt_count: attempt,
                    output_state: Value::Object(output),
                    routing_state,
                    warnings: Vec::new(),
                    trace_envelope: trace,
                });
            }
            Err(err) => {
                debug!(
                    target: "llmctl_engine::tooling",
                    tool = %config.tool_name,
                    operation = %config.operation,
                    attempt,
                    reason = %err,
                    "tool attempt failed"
                );
                calls.push(ToolCallRecord {
                    attempt,
                    status: "failed".into(),
                    reason: Some(err.message.clone()),
                });
                last_error = Some(err);
            }
        }
    }

    let last_error = last_error.unwrap_or_else(|| ToolCallError::msg("tool produced no attempts"));

    let Some(builder) = fallback_builder else {
        return Err(ToolingError::AttemptsExhausted {
            attempts: max_attempts,
            last_error,
        });
    };

    let (output_state, routing_state, warning) = builder(&last_error);
    let warnings = vec![warning];
    let trace = trace_envelope(
        &config,
        &request_id,
        &correlation_id,
        TOOL_STATUS_SUCCESS_WITH_WARNING,
        true,
        max_attempts,
        &calls,
        &warnings,
    );
    let mut output = ensure_object(output_state);
    output.insert(
        "execution_status".into(),
        json!(TOOL_STATUS_SUCCESS_WITH_WARNING),
    );
    output.insert("fallback_used".into(), json!(true));
    output.insert("warnings".into(), json!(&warnings));
    output.insert("deterministic_tooling".into(), trace.clone());
    let mut routing = ensure_object(routing_state);
    routing.insert("fallback_used".into(), json!(true));
    Ok(ToolOutcome {
        execution_status: TOOL_STATUS_SUCCESS_WITH_WARNING,
        fallback_used: true,
        attempt_count: max_attempts,
        output_state: Value::Object(output),
        routing_state: Value::Object(routing),
        warnings,
        trace_envelope: trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_defaults_cover_all_special_types() {
        let decision = resolve_base_tool_scaffold(NodeType::Decision, None);
        assert_eq!(decision.tool_name, "deterministic.decision");
        assert_eq!(decision.operation, "evaluate");

        let memory = resolve_base_tool_scaffold(NodeType::Memory, None);
        assert_eq!(memory.tool_name, "deterministic.memory");
        assert_eq!(memory.operation, "add");

        let milestone = resolve_base_tool_scaffold(NodeType::Milestone, None);
        assert_eq!(milestone.operation, "create_or_update");

        let plan = resolve_base_tool_scaffold(NodeType::Plan, None);
        assert_eq!(plan.operation, "create_or_update_plan");
    }

    #[test]
    fn scaffold_falls_back_to_default_operation() {
        let scaffold = resolve_base_tool_scaffold(NodeType::Memory, Some("unsupported-op"));
        assert_eq!(scaffold.tool_name, "deterministic.memory");
        assert_eq!(scaffold.operation, "add");
        assert_eq!(scaffold.artifact_hook_key, "memory_final_state");
    }

    #[test]
    fn scaffold_accepts_alternate_operations() {
        assert_eq!(
            resolve_base_tool_scaffold(NodeType::Memory, Some("retrieve")).operation,
            "retrieve"
        );
        assert_eq!(
            resolve_base_tool_scaffold(NodeType::Milestone, Some("mark_complete")).operation,
            "mark_complete"
        );
        assert_eq!(
            resolve_base_tool_scaffold(NodeType::Plan, Some("complete_plan_item")).operation,
            "complete_plan_item"
        );
        assert_eq!(
            resolve_base_tool_scaffold(NodeType::Decision, Some("legacy_route")).operation,
            "legacy_route"
        );
    }
}
