//! Node output, routing, artifact, and API error contracts.
//!
//! Handlers exchange free-form JSON objects; the validators here are the
//! boundary that keeps those objects honest. Fixed shapes (run metadata, API
//! errors) are typed structs whose optional fields serialize as explicit
//! `null` so the on-wire key set never varies.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::CONTRACT_VERSION;
use crate::types::{ArtifactType, NodeType};

/// Contract violations detected at a validation boundary.
///
/// A violation raised inside a handler fails the run; one raised at the API
/// boundary is returned as an [`ApiErrorEnvelope`].
#[derive(Debug, Error, Diagnostic)]
pub enum ContractError {
    #[error("{name} must be a JSON object")]
    #[diagnostic(code(llmctl_engine::contracts::not_an_object))]
    NotAnObject { name: &'static str },

    #[error("{name} is missing required keys: {keys}")]
    #[diagnostic(
        code(llmctl_engine::contracts::missing_keys),
        help("Populate every required key before crossing the contract boundary.")
    )]
    MissingKeys { name: &'static str, keys: String },

    #[error("{name}.{field}: {reason}")]
    #[diagnostic(code(llmctl_engine::contracts::invalid_field))]
    InvalidField {
        name: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("event_type '{raw}' cannot be normalized to domain:entity:action")]
    #[diagnostic(
        code(llmctl_engine::contracts::event_type),
        help("Event types need at least three ':'- or '.'-separated segments.")
    )]
    EventType { raw: String },

    #[error("run metadata rejected: {reason}")]
    #[diagnostic(code(llmctl_engine::contracts::run_metadata))]
    RunMetadata { reason: String },
}

// ============================================================================
// Node output & routing validators
// ============================================================================

fn as_object<'a>(value: &'a Value, name: &'static str) -> Result<&'a Map<String, Value>, ContractError> {
    value.as_object().ok_or(ContractError::NotAnObject { name })
}

fn require_keys(
    payload: &Map<String, Value>,
    required: &[&str],
    name: &'static str,
) -> Result<(), ContractError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| !payload.contains_key(*key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ContractError::MissingKeys {
            name,
            keys: missing.join(", "),
        })
    }
}

fn non_empty_string_list(value: &Value) -> bool {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .all(|item| item.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// Validate the base node output shape: a JSON object whose `node_type` is a
/// non-empty string, optionally matched against the executed node's type.
pub fn validate_node_output(
    output_state: &Value,
    expected_node_type: Option<NodeType>,
) -> Result<(), ContractError> {
    let payload = as_object(output_state, "output_state")?;
    let node_type = payload
        .get("node_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if node_type.is_empty() {
        return Err(ContractError::InvalidField {
            name: "output_state",
            field: "node_type",
            reason: "required".into(),
        });
    }
    if let Some(expected) = expected_node_type {
        if !node_type.eq_ignore_ascii_case(expected.encode()) {
            return Err(ContractError::InvalidField {
                name: "output_state",
                field: "node_type",
                reason: format!("must be '{}', got '{node_type}'", expected.encode()),
            });
        }
    }
    Ok(())
}

/// Validate the routing output shape. All keys are optional, but a present
/// `route_key` must be non-empty and flags must be booleans.
pub fn validate_routing_output(routing_state: &Value) -> Result<(), ContractError> {
    let payload = as_object(routing_state, "routing_state")?;
    if let Some(route_key) = payload.get("route_key") {
        let valid = route_key
            .as_str()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !valid {
            return Err(ContractError::InvalidField {
                name: "routing_state",
                field: "route_key",
                reason: "must be a non-empty string".into(),
            });
        }
    }
    for flag in ["terminate_run", "no_match", "fallback_used"] {
        if let Some(value) = payload.get(flag) {
            if !value.is_boolean() {
                return Err(ContractError::InvalidField {
                    name: "routing_state",
                    field: match flag {
                        "terminate_run" => "terminate_run",
                        "no_match" => "no_match",
                        _ => "fallback_used",
                    },
                    reason: "must be boolean".into(),
                });
            }
        }
    }
    for list in ["matched_connector_ids", "evaluations"] {
        if let Some(value) = payload.get(list) {
            if !value.is_array() {
                return Err(ContractError::InvalidField {
                    name: "routing_state",
                    field: match list {
                        "matched_connector_ids" => "matched_connector_ids",
                        _ => "evaluations",
                    },
                    reason: "must be an array".into(),
                });
            }
        }
    }
    Ok(())
}

/// Required output keys for each special node type.
fn special_required_keys(node_type: NodeType) -> &'static [&'static str] {
    match node_type {
        NodeType::Decision => &["node_type", "matched_connector_ids", "evaluations", "no_match"],
        NodeType::Memory | NodeType::Milestone => &["node_type", "action", "action_results"],
        NodeType::Plan => &["node_type", "mode", "store_mode", "action_results"],
        _ => &[],
    }
}

/// Validate a special node's `(output_state, routing_state)` pair.
///
/// Decision outputs reject empty-string entries in `matched_connector_ids`
/// and non-boolean `no_match`; memory/milestone need a non-empty `action` and
/// an `action_results` array; plan needs `mode`, `store_mode`, and
/// `action_results`.
pub fn validate_special_node_output(
    node_type: NodeType,
    output_state: &Value,
    routing_state: &Value,
) -> Result<(), ContractError> {
    validate_node_output(output_state, Some(node_type))?;
    validate_routing_output(routing_state)?;

    let payload = as_object(output_state, "output_state")?;
    let required = special_required_keys(node_type);
    if !required.is_empty() {
        require_keys(payload, required, "output_state")?;
    }

    match node_type {
        NodeType::Decision => {
            if !payload
                .get("evaluations")
                .map(Value::is_array)
                .unwrap_or(false)
            {
                return Err(ContractError::InvalidField {
                    name: "output_state",
                    field: "evaluations",
                    reason: "must be an array".into(),
                });
            }
            if !payload
                .get("no_match")
                .map(Value::is_boolean)
                .unwrap_or(false)
            {
                return Err(ContractError::InvalidField {
                    name: "output_state",
                    field: "no_match",
                    reason: "must be boolean".into(),
                });
            }
            for (name, source) in [
                ("output_state", payload.get("matched_connector_ids")),
                (
                    "routing_state",
                    routing_state.get("matched_connector_ids"),
                ),
            ] {
                if let Some(ids) = source {
                    if !non_empty_string_list(ids) {
                        return Err(ContractError::InvalidField {
                            name: if name == "output_state" {
                                "output_state"
                            } else {
                                "routing_state"
                            },
                            field: "matched_connector_ids",
                            reason: "must contain non-empty strings".into(),
                        });
                    }
                }
            }
        }
        NodeType::Memory | NodeType::Milestone => {
            let action = payload
                .get("action")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if action.is_empty() {
                return Err(ContractError::InvalidField {
                    name: "output_state",
                    field: "action",
                    reason: "required".into(),
                });
            }
            if !payload
                .get("action_results")
                .map(Value::is_array)
                .unwrap_or(false)
            {
                return Err(ContractError::InvalidField {
                    name: "output_state",
                    field: "action_results",
                    reason: "must be an array".into(),
                });
            }
        }
        NodeType::Plan => {
            for field in ["mode", "store_mode"] {
                let present = payload
                    .get(field)
                    .and_then(Value::as_str)
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                if !present {
                    return Err(ContractError::InvalidField {
                        name: "output_state",
                        field: if field == "mode" { "mode" } else { "store_mode" },
                        reason: "required".into(),
                    });
                }
            }
            if !payload
                .get("action_results")
                .map(Value::is_array)
                .unwrap_or(false)
            {
                return Err(ContractError::InvalidField {
                    name: "output_state",
                    field: "action_results",
                    reason: "must be an array".into(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Required keys per artifact payload type.
fn artifact_required_keys(artifact_type: ArtifactType) -> &'static [&'static str] {
    match artifact_type {
        ArtifactType::Decision => {
            &["matched_connector_ids", "evaluations", "no_match", "routing_state"]
        }
        ArtifactType::Memory => &["action", "action_results", "routing_state"],
        ArtifactType::Milestone => &["action", "action_results", "milestone", "routing_state"],
        ArtifactType::Plan => &["mode", "store_mode", "action_results", "plan", "routing_state"],
        ArtifactType::Start
        | ArtifactType::End
        | ArtifactType::Task
        | ArtifactType::Flowchart
        | ArtifactType::Rag => &["node_type", "input_context", "output_state", "routing_state"],
    }
}

/// Validate a node artifact payload before persistence.
///
/// Every artifact payload must carry a `routing_state` object that itself
/// satisfies the routing contract.
pub fn validate_artifact_payload(
    artifact_type: ArtifactType,
    artifact_payload: &Value,
) -> Result<(), ContractError> {
    let payload = as_object(artifact_payload, "artifact_payload")?;
    require_keys(payload, artifact_required_keys(artifact_type), "artifact_payload")?;
    let routing = payload
        .get("routing_state")
        .ok_or(ContractError::MissingKeys {
            name: "artifact_payload",
            keys: "routing_state".into(),
        })?;
    if !routing.is_object() {
        return Err(ContractError::InvalidField {
            name: "artifact_payload",
            field: "routing_state",
            reason: "must be a JSON object".into(),
        });
    }
    validate_routing_output(routing)
}

// ============================================================================
// Routing output builder
// ============================================================================

/// Typed builder for routing state objects.
///
/// Handlers that construct routing output in Rust use this builder; the free
/// `Value` form remains the contract of record, so [`into_value`](Self::into_value)
/// serializes only the fields that were set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingOutput {
    pub route_key: Option<String>,
    pub terminate_run: Option<bool>,
    pub matched_connector_ids: Option<Vec<String>>,
    pub evaluations: Option<Vec<Value>>,
    pub no_match: Option<bool>,
    pub fallback_used: Option<bool>,
    pub fallback_reason: Option<String>,
}

impl RoutingOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_route_key(mut self, route_key: impl Into<String>) -> Self {
        self.route_key = Some(route_key.into());
        self
    }

    #[must_use]
    pub fn with_terminate_run(mut self, terminate: bool) -> Self {
        self.terminate_run = Some(terminate);
        self
    }

    #[must_use]
    pub fn with_matched_connector_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.matched_connector_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_evaluations(mut self, evaluations: Vec<Value>) -> Self {
        self.evaluations = Some(evaluations);
        self
    }

    #[must_use]
    pub fn with_no_match(mut self, no_match: bool) -> Self {
        self.no_match = Some(no_match);
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, reason: impl Into<String>) -> Self {
        self.fallback_used = Some(true);
        self.fallback_reason = Some(reason.into());
        self
    }

    /// Serialize into the free-form routing object, omitting unset fields.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut map = Map::new();
        if let Some(route_key) = self.route_key {
            map.insert("route_key".into(), json!(route_key));
        }
        if let Some(terminate) = self.terminate_run {
            map.insert("terminate_run".into(), json!(terminate));
        }
        if let Some(ids) = self.matched_connector_ids {
            map.insert("matched_connector_ids".into(), json!(ids));
        }
        if let Some(evaluations) = self.evaluations {
            map.insert("evaluations".into(), Value::Array(evaluations));
        }
        if let Some(no_match) = self.no_match {
            map.insert("no_match".into(), json!(no_match));
        }
        if let Some(fallback_used) = self.fallback_used {
            map.insert("fallback_used".into(), json!(fallback_used));
        }
        if let Some(reason) = self.fallback_reason {
            map.insert("fallback_reason".into(), json!(reason));
        }
        Value::Object(map)
    }
}

// ============================================================================
// Run metadata (on-wire, exactly 11 keys)
// ============================================================================

/// Provider dispatch lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    DispatchPending,
    DispatchConfirmed,
    DispatchFailed,
    DispatchFallbackStarted,
}

impl DispatchStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            DispatchStatus::DispatchPending => "dispatch_pending",
            DispatchStatus::DispatchConfirmed => "dispatch_confirmed",
            DispatchStatus::DispatchFailed => "dispatch_failed",
            DispatchStatus::DispatchFallbackStarted => "dispatch_fallback_started",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dispatch_pending" => Some(DispatchStatus::DispatchPending),
            "dispatch_confirmed" => Some(DispatchStatus::DispatchConfirmed),
            "dispatch_failed" => Some(DispatchStatus::DispatchFailed),
            "dispatch_fallback_started" => Some(DispatchStatus::DispatchFallbackStarted),
            _ => None,
        }
    }
}

/// The on-wire run metadata schema: exactly these 11 keys, absent optional
/// fields serialized as `null`, never omitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub selected_provider: Option<String>,
    pub final_provider: Option<String>,
    pub provider_dispatch_id: Option<String>,
    pub workspace_identity: Option<String>,
    pub dispatch_status: Option<DispatchStatus>,
    pub fallback_attempted: bool,
    pub fallback_reason: Option<String>,
    pub dispatch_uncertain: bool,
    pub api_failure_category: Option<String>,
    pub cli_fallback_used: bool,
    pub cli_preflight_passed: Option<bool>,
}

impl RunMetadata {
    /// Serialize as a JSON object (all 11 keys present).
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn clean_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    if text.is_empty() { None } else { Some(text) }
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => default,
        },
        _ => default,
    }
}

/// Normalize a free-form runtime payload into the 11-key schema.
///
/// String flags are coerced, whitespace is trimmed, and unknown
/// `selected_provider` / `dispatch_status` vocabulary is rejected at this
/// boundary rather than silently persisted.
pub fn normalize_run_metadata(runtime: &Value) -> Result<RunMetadata, ContractError> {
    let payload = as_object(runtime, "run_metadata")?;

    let selected_provider = clean_text(payload.get("selected_provider"));
    if let Some(ref provider) = selected_provider {
        if provider != "workspace" && provider != "kubernetes" {
            return Err(ContractError::RunMetadata {
                reason: format!("unknown selected_provider '{provider}'"),
            });
        }
    }
    let dispatch_status = match clean_text(payload.get("dispatch_status")) {
        Some(raw) => Some(DispatchStatus::decode(&raw).ok_or(ContractError::RunMetadata {
            reason: format!("unknown dispatch_status '{raw}'"),
        })?),
        None => None,
    };

    Ok(RunMetadata {
        selected_provider,
        final_provider: clean_text(payload.get("final_provider")),
        provider_dispatch_id: clean_text(payload.get("provider_dispatch_id")),
        workspace_identity: clean_text(payload.get("workspace_identity")),
        dispatch_status,
        fallback_attempted: coerce_bool(payload.get("fallback_attempted"), false),
        fallback_reason: clean_text(payload.get("fallback_reason")),
        dispatch_uncertain: coerce_bool(payload.get("dispatch_uncertain"), false),
        api_failure_category: clean_text(payload.get("api_failure_category")),
        cli_fallback_used: coerce_bool(payload.get("cli_fallback_used"), false),
        cli_preflight_passed: match payload.get("cli_preflight_passed") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            other => Some(coerce_bool(other, false)),
        },
    })
}

// ============================================================================
// Degraded markers
// ============================================================================

/// Derive `(degraded, reason)` for a node run from its runtime payload.
///
/// Reason precedence: `fallback_reason` > `api_failure_category` >
/// `dispatch_uncertain` > `cli_fallback_used` > `deterministic_fallback_used`
/// > `success_with_warning` > `degraded`.
#[must_use]
pub fn resolve_node_degraded_markers(runtime_payload: &Value) -> (bool, Option<String>) {
    let Some(payload) = runtime_payload.as_object() else {
        return (false, None);
    };
    let fallback_attempted = coerce_bool(payload.get("fallback_attempted"), false);
    let dispatch_uncertain = coerce_bool(payload.get("dispatch_uncertain"), false);
    let cli_fallback_used = coerce_bool(payload.get("cli_fallback_used"), false);
    let deterministic_fallback_used =
        coerce_bool(payload.get("deterministic_fallback_used"), false);
    let deterministic_execution_status = payload
        .get("deterministic_execution_status")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let fallback_reason = clean_text(payload.get("fallback_reason"));
    let api_failure_category = clean_text(payload.get("api_failure_category"));

    let degraded = fallback_attempted
        || dispatch_uncertain
        || cli_fallback_used
        || deterministic_fallback_used
        || deterministic_execution_status == "success_with_warning"
        || fallback_reason.is_some()
        || api_failure_category.is_some();
    if !degraded {
        return (false, None);
    }
    if let Some(reason) = fallback_reason {
        return (true, Some(reason));
    }
    if let Some(category) = api_failure_category {
        return (true, Some(category));
    }
    if dispatch_uncertain {
        return (true, Some("dispatch_uncertain".into()));
    }
    if cli_fallback_used {
        return (true, Some("cli_fallback_used".into()));
    }
    if deterministic_fallback_used {
        return (true, Some("deterministic_fallback_used".into()));
    }
    if deterministic_execution_status == "success_with_warning" {
        return (true, Some("success_with_warning".into()));
    }
    (true, Some("degraded".into()))
}

// ============================================================================
// API error envelope
// ============================================================================

/// Error body carried by [`ApiErrorEnvelope`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub contract_version: String,
    pub code: String,
    pub message: String,
    pub details: Value,
    pub request_id: Option<String>,
}

/// Envelope returned for HTTP and socket errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiErrorEnvelope {
    pub ok: bool,
    pub error: ApiError,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ApiErrorEnvelope {
    /// Build an error envelope with the given code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: ApiError {
                contract_version: CONTRACT_VERSION.to_string(),
                code: code.into(),
                message: message.into(),
                details: Value::Object(Map::new()),
                request_id: None,
            },
            correlation_id: None,
        }
    }

    /// Conventional envelope for request validation failures.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", message)
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = details;
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.error.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_output_builder_only_serializes_set_fields() {
        let value = RoutingOutput::new()
            .with_route_key("approve")
            .with_no_match(false)
            .into_value();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["route_key"], "approve");
    }

    #[test]
    fn run_metadata_serializes_all_eleven_keys() {
        let value = RunMetadata::default().to_value();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 11);
        assert!(map["selected_provider"].is_null());
        assert_eq!(map["fallback_attempted"], false);
    }

    #[test]
    fn degraded_reason_prefers_fallback_reason_over_category() {
        let (degraded, reason) = resolve_node_degraded_markers(&json!({
            "fallback_reason": "provider_unavailable",
            "api_failure_category": "socket_missing",
        }));
        assert!(degraded);
        assert_eq!(reason.as_deref(), Some("provider_unavailable"));
    }
}
