//! Decision node handler.
//!
//! With `decision_conditions` configured (or the runtime cutover flag set),
//! the node evaluates each condition against the upstream input context and
//! routes on matched connector ids. Without conditions it falls back to the
//! legacy `route_field_path` lookup, emitting the looked-up value as the
//! routing `route_key`.
//!
//! Condition syntax is intentionally small: `path.to.field == literal`,
//! `path.to.field != literal`, or a bare path whose truthiness is the match.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::contracts::{RoutingOutput, validate_special_node_output};
use crate::model::DecisionCondition;
use crate::tooling::{
    ToolCallError, ToolFallbackBuilder, ToolInvocationConfig, ToolValidate, build_fallback_warning,
    invoke_deterministic_tool, resolve_base_tool_scaffold,
};
use crate::types::NodeType;
use crate::utils::json_ext::get_dot_path;

/// Config flag forcing the `evaluate` operation on legacy-configured nodes.
pub const RUNTIME_CUTOVER_FLAG_KEY: &str = "agent_runtime_cutover";

#[derive(Clone, Copy, Debug, Default)]
pub struct DecisionHandler;

impl DecisionHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn literal_eq(value: &Value, literal: &str) -> bool {
    let literal = literal.trim().trim_matches('\'').trim_matches('"');
    match value {
        Value::String(s) => s == literal,
        Value::Bool(b) => literal.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        Value::Number(n) => n.to_string() == literal,
        Value::Null => literal.eq_ignore_ascii_case("null"),
        other => other.to_string() == literal,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate one condition against the input context.
#[must_use]
pub fn evaluate_condition(condition_text: &str, input_context: &Value) -> (bool, String) {
    let text = condition_text.trim();
    if text.is_empty() {
        return (false, "empty condition".to_string());
    }
    if let Some((path, literal)) = text.split_once("==") {
        let path = path.trim();
        return match get_dot_path(input_context, path) {
            Some(value) if literal_eq(value, literal) => {
                (true, format!("{path} == {}", literal.trim()))
            }
            Some(_) => (false, format!("{path} != {}", literal.trim())),
            None => (false, format!("{path} not present")),
        };
    }
    if let Some((path, literal)) = text.split_once("!=") {
        let path = path.trim();
        return match get_dot_path(input_context, path) {
            Some(value) if !literal_eq(value, literal) => {
                (true, format!("{path} != {}", literal.trim()))
            }
            Some(_) => (false, format!("{path} == {}", literal.trim())),
            None => (false, format!("{path} not present")),
        };
    }
    match get_dot_path(input_context, text) {
        Some(value) if is_truthy(value) => (true, format!("{text} is truthy")),
        Some(_) => (false, format!("{text} is falsy")),
        None => (false, format!("{text} not present")),
    }
}

fn evaluate_conditions(
    conditions: &[DecisionCondition],
    input_context: &Value,
) -> (Value, Value) {
    let mut matched_ids = Vec::new();
    let mut evaluations = Vec::new();
    for condition in conditions {
        let (matched, reason) = evaluate_condition(&condition.condition_text, input_context);
        if matched {
            matched_ids.push(condition.connector_id.clone());
        }
        evaluations.push(json!({
            "connector_id": condition.connector_id.clone(),
            "condition_text": condition.condition_text.clone(),
            "matched": matched,
            "reason": reason,
        }));
    }
    let no_match = matched_ids.is_empty();
    let output_state = json!({
        "node_type": "decision",
        "matched_connector_ids": matched_ids.clone(),
        "evaluations": evaluations,
        "no_match": no_match,
    });
    let routing_state = RoutingOutput::new()
        .with_matched_connector_ids(matched_ids)
        .with_evaluations(
            output_state["evaluations"].as_array().cloned().unwrap_or_default(),
        )
        .with_no_match(no_match)
        .into_value();
    (output_state, routing_state)
}

fn legacy_route(route_field_path: &str, input_context: &Value) -> (Value, Value) {
    let looked_up = get_dot_path(input_context, route_field_path).cloned();
    let route_key = looked_up.as_ref().and_then(|value| match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let matched = route_key.is_some();
    let evaluation = json!({
        "connector_id": route_key.clone().unwrap_or_default(),
        "condition_text": format!("route_field_path: {route_field_path}"),
        "matched": matched,
        "reason": if matched { "field resolved" } else { "field missing or empty" },
    });
    let output_state = json!({
        "node_type": "decision",
        "matched_connector_ids": [],
        "evaluations": [evaluation],
        "no_match": !matched,
    });
    let mut routing = RoutingOutput::new()
        .with_matched_connector_ids(Vec::<String>::new())
        .with_no_match(!matched);
    if let Some(key) = route_key {
        routing = routing.with_route_key(key);
    }
    (output_state, routing.into_value())
}

fn no_match_fallback(error: &ToolCallError) -> (Value, Value, crate::tooling::ToolWarning) {
    let output_state = json!({
        "node_type": "decision",
        "matched_connector_ids": [],
        "evaluations": [],
        "no_match": true,
    });
    let routing_state = RoutingOutput::new()
        .with_matched_connector_ids(Vec::<String>::new())
        .with_evaluations(Vec::new())
        .with_no_match(true)
        .into_value();
    (
        output_state,
        routing_state,
        build_fallback_warning(error.message.clone()),
    )
}

#[async_trait]
impl NodeHandler for DecisionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Decision
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let conditions = request.node.decision_conditions();
        let cutover = request.config_bool(RUNTIME_CUTOVER_FLAG_KEY, false);
        let operation = if !conditions.is_empty() || cutover {
            "evaluate"
        } else {
            "legacy_route"
        };
        let scaffold = resolve_base_tool_scaffold(NodeType::Decision, Some(operation));

        let config = ToolInvocationConfig::new(NodeType::Decision, scaffold.tool_name, scaffold.operation)
            .with_execution_id(request.execution_id)
            .with_request_id(request.request_id.clone())
            .with_correlation_id(request.correlation_id.clone())
            .with_idempotency_key(request.tool_idempotency_key(operation));

        let route_field_path = request.config_str("route_field_path");
        let input_context = request.input_context.clone();
        let invoke = move || {
            let conditions = conditions.clone();
            let route_field_path = route_field_path.clone();
            let input_context = input_context.clone();
            let operation = operation.to_string();
            async move {
                let (output_state, routing_state) = if operation == "evaluate" {
                    evaluate_conditions(&conditions, &input_context)
                } else {
                    let path = route_field_path.ok_or_else(|| {
                        ToolCallError::msg("decision node is missing route_field_path")
                    })?;
                    legacy_route(&path, &input_context)
                };
                Ok((output_state, routing_state))
            }
        };

        let validate: ToolValidate = Box::new(|output_state, routing_state| {
            validate_special_node_output(NodeType::Decision, output_state, routing_state)
                .map_err(|err| ToolCallError::msg(err.to_string()))
        });
        let strict = request
            .config_str("tool_fallback_mode")
            .map(|mode| mode == "strict")
            .unwrap_or(false);
        let fallback: Option<ToolFallbackBuilder> = if strict {
            None
        } else {
            Some(Box::new(no_match_fallback))
        };

        let outcome = invoke_deterministic_tool(config, invoke, Some(validate), fallback).await?;
        Ok(NodeHandlerOutput::new(outcome.output_state, outcome.routing_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_conditions_compare_against_dot_paths() {
        let context = json!({
            "latest_upstream": {"output_state": {"route_key": "approve"}}
        });
        let (matched, _) =
            evaluate_condition("latest_upstream.output_state.route_key == approve", &context);
        assert!(matched);
        let (matched, _) =
            evaluate_condition("latest_upstream.output_state.route_key == reject", &context);
        assert!(!matched);
    }

    #[test]
    fn bare_paths_check_truthiness() {
        let context = json!({"flags": {"ready": true, "empty": ""}});
        assert!(evaluate_condition("flags.ready", &context).0);
        assert!(!evaluate_condition("flags.empty", &context).0);
        assert!(!evaluate_condition("flags.missing", &context).0);
    }
}
