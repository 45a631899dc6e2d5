//! Task node handler.
//!
//! Builds a prompt envelope out of the resolved instruction context and the
//! upstream input, invokes the configured model through the [`ModelInvoker`]
//! seam, and parses the returned JSON into the node output state. Skill
//! fallback entries and resolved instruction facts arrive on the input
//! context under `runtime`, placed there by the run loop after instruction
//! and skill materialization.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::types::NodeType;

/// Seam over the frontier LLM invocation.
///
/// Implementations wrap a provider SDK or CLI runtime; the engine only sees
/// the prompt envelope in and raw response text out.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, prompt_envelope: &Value, model_id: Option<i64>)
    -> Result<String, NodeError>;
}

pub struct TaskHandler {
    model: Arc<dyn ModelInvoker>,
}

impl TaskHandler {
    #[must_use]
    pub fn new(model: Arc<dyn ModelInvoker>) -> Self {
        Self { model }
    }

    /// Assemble the prompt envelope for one task execution.
    #[must_use]
    pub fn build_prompt_envelope(request: &NodeHandlerRequest) -> Value {
        let runtime = request
            .input_context
            .get("runtime")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let agent_profile = json!({
            "agent_markdown": runtime.get("agent_markdown").cloned().unwrap_or(Value::Null),
            "role_markdown": runtime.get("role_markdown").cloned().unwrap_or(Value::Null),
            "instruction_manifest_hash": runtime
                .get("instruction_manifest_hash")
                .cloned()
                .unwrap_or(Value::Null),
            "skill_fallback_entries": runtime
                .get("skill_fallback_entries")
                .cloned()
                .unwrap_or_else(|| json!([])),
        });
        json!({
            "system_contract": "You are a flowchart task executor. Respond with a single JSON object.",
            "agent_profile": agent_profile,
            "task_context": request.input_context.clone(),
            "output_contract": {
                "node_type": "task",
                "structured_output": "object",
                "routing_state": "optional object",
            },
            "user_request": request
                .node
                .config_str("prompt")
                .unwrap_or_else(|| request.node.title.clone()),
        })
    }

    /// Parse the model response into `(output_state, routing_state)`.
    ///
    /// Non-JSON responses are preserved under `raw_response` rather than
    /// dropped; `node_type` is stamped when absent.
    #[must_use]
    pub fn parse_model_response(raw: &str) -> (Value, Value) {
        let parsed: Value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| json!({"raw_response": raw}));
        let mut output = match parsed {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("raw_response".to_string(), other);
                map
            }
        };
        output
            .entry("node_type".to_string())
            .or_insert_with(|| json!("task"));
        let routing_state = output
            .remove("routing_state")
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        (Value::Object(output), routing_state)
    }
}

#[async_trait]
impl NodeHandler for TaskHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Task
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let prompt = Self::build_prompt_envelope(&request);
        let raw = self.model.invoke(&prompt, request.node.model_id).await?;
        let (output_state, routing_state) = Self::parse_model_response(&raw);
        Ok(NodeHandlerOutput::new(output_state, routing_state))
    }
}
