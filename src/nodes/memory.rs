//! Memory node handler.
//!
//! Two execution modes share one deterministic writer:
//!
//! - `deterministic` calls the memory tool (e.g. `llmctl-mcp`) directly;
//! - `llm_guided` asks the model for a `{text, store_mode, confidence}`
//!   payload, validates it, then replays it through the deterministic writer.
//!
//! The configured mode is primary and retried `retry_count` times. On
//! exhaustion, `fallback_enabled` switches to the other mode exactly once; a
//! fallback success is marked `success_with_warning` with `failed_mode` and a
//! classified `fallback_reason`, while a fallback failure raises
//! `fallback_runtime_error`. For `retrieve`, an empty primary result counts
//! as `primary_empty_result`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::task::ModelInvoker;
use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::contracts::validate_special_node_output;
use crate::tooling::{
    ToolCallError, ToolInvocationConfig, ToolValidate, ToolingError, build_fallback_warning,
    invoke_deterministic_tool, resolve_base_tool_scaffold,
};
use crate::types::NodeType;
use crate::utils::json_ext::ensure_object;

/// Primary mode raised an error.
pub const FALLBACK_REASON_PRIMARY_RUNTIME_ERROR: &str = "primary_runtime_error";
/// Primary `retrieve` returned nothing.
pub const FALLBACK_REASON_PRIMARY_EMPTY_RESULT: &str = "primary_empty_result";
/// LLM-guided payload failed validation.
pub const FALLBACK_REASON_LLM_VALIDATION_ERROR: &str = "llm_validation_error";

/// Seam over the deterministic memory tool.
///
/// `action` is one of `add`, `retrieve`, `delete`; the returned object is
/// merged into the node output (e.g. `{"retrieved_memories": [...]}`).
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn execute(&self, action: &str, payload: Value) -> Result<Value, ToolCallError>;
}

/// Memory node handler with primary/fallback mode orchestration.
pub struct MemoryHandler {
    backend: Arc<dyn MemoryBackend>,
    model: Arc<dyn ModelInvoker>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemoryMode {
    Deterministic,
    LlmGuided,
}

impl MemoryMode {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("llm_guided") => MemoryMode::LlmGuided,
            _ => MemoryMode::Deterministic,
        }
    }

    fn other(self) -> Self {
        match self {
            MemoryMode::Deterministic => MemoryMode::LlmGuided,
            MemoryMode::LlmGuided => MemoryMode::Deterministic,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MemoryMode::Deterministic => "deterministic",
            MemoryMode::LlmGuided => "llm_guided",
        }
    }
}

/// A failed mode run with its classified reason.
#[derive(Debug)]
struct ModeFailure {
    reason: &'static str,
    message: String,
}

impl MemoryHandler {
    #[must_use]
    pub fn new(backend: Arc<dyn MemoryBackend>, model: Arc<dyn ModelInvoker>) -> Self {
        Self { backend, model }
    }

    /// Validate and parse the model's guided payload.
    fn parse_guided_payload(raw: &str) -> Result<(String, String), ToolCallError> {
        let invalid = |message: String| {
            ToolCallError::msg(message).with_kind(FALLBACK_REASON_LLM_VALIDATION_ERROR)
        };
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|err| invalid(format!("guided payload is not JSON: {err}")))?;
        let text = parsed
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| invalid("guided payload is missing text".to_string()))?;
        let store_mode = parsed
            .get("store_mode")
            .and_then(Value::as_str)
            .unwrap_or("replace");
        if store_mode != "replace" && store_mode != "append" {
            return Err(invalid(format!("guided store_mode '{store_mode}' is invalid")));
        }
        let confidence = parsed.get("confidence").and_then(Value::as_f64).unwrap_or(1.0);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid(format!("guided confidence {confidence} is out of range")));
        }
        Ok((text.to_string(), store_mode.to_string()))
    }

    async fn run_mode(
        &self,
        mode: MemoryMode,
        action: &str,
        request: &NodeHandlerRequest,
        attempts: u32,
    ) -> Result<(Value, Value), ModeFailure> {
        let scaffold = resolve_base_tool_scaffold(NodeType::Memory, Some(action));
        let operation = scaffold.operation.clone();
        let config = ToolInvocationConfig::new(NodeType::Memory, scaffold.tool_name, operation.clone())
            .with_execution_id(request.execution_id)
            .with_request_id(request.request_id.clone())
            .with_correlation_id(request.correlation_id.clone())
            .with_idempotency_key(format!(
                "{}:{}",
                request.tool_idempotency_key(&operation),
                mode.as_str()
            ))
            .with_max_attempts(attempts);

        let backend = Arc::clone(&self.backend);
        let model = Arc::clone(&self.model);
        let node_config = request.node.config.clone();
        let input_context = request.input_context.clone();
        let action_owned = operation.clone();
        let model_id = request.node.model_id;

        let invoke = move || {
            let backend = Arc::clone(&backend);
            let model = Arc::clone(&model);
            let node_config = node_config.clone();
            let input_context = input_context.clone();
            let action = action_owned.clone();
            async move {
                let mut payload = ensure_object(json!({
                    "config": node_config,
                    "input_context": input_context.clone(),
                }));
                if mode == MemoryMode::LlmGuided {
                    let prompt = json!({
                        "system_contract": "Produce a memory payload as JSON.",
                        "task_context": input_context,
                        "output_contract": {
                            "text": "string",
                            "store_mode": "replace|append",
                            "confidence": "0..1",
                        },
                    });
                    let raw = model
                        .invoke(&prompt, model_id)
                        .await
                        .map_err(|err| ToolCallError::msg(err.to_string()))?;
                    let (text, store_mode) = Self::parse_guided_payload(&raw)?;
                    payload.insert("text".into(), json!(text));
                    payload.insert("store_mode".into(), json!(store_mode));
                }
                let fragment = backend.execute(&action, Value::Object(payload)).await?;

                if action == "retrieve" {
                    let empty = fragment
                        .get("retrieved_memories")
                        .and_then(Value::as_array)
                        .map(Vec::is_empty)
                        .unwrap_or(true);
                    if empty {
                        return Err(ToolCallError::msg("memory retrieve returned no results")
                            .with_kind(FALLBACK_REASON_PRIMARY_EMPTY_RESULT));
                    }
                }

                let mut output = ensure_object(json!({
                    "node_type": "memory",
                    "action": action.clone(),
                    "action_results": [format!("{action} completed")],
                }));
                for (key, value) in ensure_object(fragment) {
                    output.insert(key, value);
                }
                Ok((Value::Object(output), json!({})))
            }
        };

        let validate: ToolValidate = Box::new(|output_state, routing_state| {
            validate_special_node_output(NodeType::Memory, output_state, routing_state)
                .map_err(|err| ToolCallError::msg(err.to_string()))
        });

        match invoke_deterministic_tool(config, invoke, Some(validate), None).await {
            Ok(outcome) => Ok((outcome.output_state, outcome.routing_state)),
            Err(ToolingError::AttemptsExhausted { last_error, .. }) => {
                let reason = match last_error.kind.as_deref() {
                    Some(FALLBACK_REASON_PRIMARY_EMPTY_RESULT) => {
                        FALLBACK_REASON_PRIMARY_EMPTY_RESULT
                    }
                    Some(FALLBACK_REASON_LLM_VALIDATION_ERROR) => {
                        FALLBACK_REASON_LLM_VALIDATION_ERROR
                    }
                    _ => FALLBACK_REASON_PRIMARY_RUNTIME_ERROR,
                };
                Err(ModeFailure {
                    reason,
                    message: last_error.message,
                })
            }
            Err(ToolingError::IdempotencyConflict { key }) => Err(ModeFailure {
                reason: FALLBACK_REASON_PRIMARY_RUNTIME_ERROR,
                message: format!("duplicate tool idempotency key: {key}"),
            }),
        }
    }

    fn mark_fallback(
        output_state: Value,
        routing_state: Value,
        failed_mode: MemoryMode,
        reason: &str,
        message: &str,
        route_key: Option<String>,
    ) -> (Value, Value) {
        let mut output = ensure_object(output_state);
        output.insert("execution_status".into(), json!("success_with_warning"));
        output.insert("fallback_used".into(), json!(true));
        output.insert("failed_mode".into(), json!(failed_mode.as_str()));
        output.insert("fallback_reason".into(), json!(reason));
        output.insert("warnings".into(), json!([build_fallback_warning(message)]));
        let mut routing = ensure_object(routing_state);
        routing.insert("fallback_used".into(), json!(true));
        routing.insert("fallback_reason".into(), json!(reason));
        if let Some(key) = route_key {
            routing.insert("route_key".into(), json!(key));
        }
        (Value::Object(output), Value::Object(routing))
    }
}

#[async_trait]
impl NodeHandler for MemoryHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Memory
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let action = request
            .config_str("action")
            .unwrap_or_else(|| "add".to_string());
        let primary_mode = MemoryMode::parse(request.config_str("mode").as_deref());
        let retry_count = request.config_u32("retry_count", 0);
        let fallback_enabled = request.config_bool("fallback_enabled", false);
        let tool_fallback_mode = request.config_str("tool_fallback_mode");

        let primary = self
            .run_mode(primary_mode, &action, &request, retry_count + 1)
            .await;
        let failure = match primary {
            Ok((output_state, routing_state)) => {
                return Ok(NodeHandlerOutput::new(output_state, routing_state));
            }
            Err(failure) => failure,
        };

        // conflict_only tool fallback: recover conflict-shaped failures with
        // a warning outcome, keep everything else strict.
        if tool_fallback_mode.as_deref() == Some("conflict_only") {
            if failure.message.to_lowercase().contains("conflict") {
                let output_state = json!({
                    "node_type": "memory",
                    "action": action.clone(),
                    "action_results": [],
                    "deterministic_tooling": {
                        "tool_name": "deterministic.memory",
                        "operation": action,
                        "execution_status": "success_with_warning",
                        "fallback_used": true,
                    },
                });
                let (output_state, routing_state) = Self::mark_fallback(
                    output_state,
                    json!({}),
                    primary_mode,
                    FALLBACK_REASON_PRIMARY_RUNTIME_ERROR,
                    &failure.message,
                    request.config_str("route_key"),
                );
                return Ok(NodeHandlerOutput::new(output_state, routing_state));
            }
            return Err(NodeError::Execution(ToolCallError::msg(failure.message)));
        }

        if !fallback_enabled {
            return Err(NodeError::Execution(ToolCallError::msg(failure.message)));
        }

        let fallback_mode = primary_mode.other();
        debug!(
            target: "llmctl_engine::nodes",
            failed_mode = primary_mode.as_str(),
            fallback_mode = fallback_mode.as_str(),
            reason = failure.reason,
            "memory primary mode exhausted; attempting fallback mode"
        );
        match self.run_mode(fallback_mode, &action, &request, 1).await {
            Ok((output_state, routing_state)) => {
                let (output_state, routing_state) = Self::mark_fallback(
                    output_state,
                    routing_state,
                    primary_mode,
                    failure.reason,
                    &failure.message,
                    None,
                );
                Ok(NodeHandlerOutput::new(output_state, routing_state))
            }
            Err(fallback_failure) => Err(NodeError::FallbackRuntime {
                primary: failure.message,
                fallback: fallback_failure.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guided_payload_validation() {
        assert!(MemoryHandler::parse_guided_payload(
            r#"{"text": "remember this", "store_mode": "append", "confidence": 0.8}"#
        )
        .is_ok());

        let err = MemoryHandler::parse_guided_payload("not json").unwrap_err();
        assert_eq!(err.kind.as_deref(), Some(FALLBACK_REASON_LLM_VALIDATION_ERROR));

        let err = MemoryHandler::parse_guided_payload(
            r#"{"text": "x", "store_mode": "overwrite"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind.as_deref(), Some(FALLBACK_REASON_LLM_VALIDATION_ERROR));

        let err = MemoryHandler::parse_guided_payload(
            r#"{"text": "x", "confidence": 1.5}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind.as_deref(), Some(FALLBACK_REASON_LLM_VALIDATION_ERROR));
    }

    #[test]
    fn mode_parsing_defaults_to_deterministic() {
        assert_eq!(MemoryMode::parse(None), MemoryMode::Deterministic);
        assert_eq!(MemoryMode::parse(Some("llm_guided")), MemoryMode::LlmGuided);
        assert_eq!(MemoryMode::parse(Some("other")), MemoryMode::Deterministic);
        assert_eq!(MemoryMode::Deterministic.other(), MemoryMode::LlmGuided);
    }
}
