//! Plan node handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::contracts::validate_special_node_output;
use crate::tooling::{
    ToolCallError, ToolInvocationConfig, ToolValidate, invoke_deterministic_tool,
    resolve_base_tool_scaffold,
};
use crate::types::NodeType;
use crate::utils::json_ext::ensure_object;

/// Seam over the plan store.
///
/// `action` is `create_or_update_plan` or `complete_plan_item`; the returned
/// object is the affected plan record.
#[async_trait]
pub trait PlanBackend: Send + Sync {
    async fn execute(&self, action: &str, payload: Value) -> Result<Value, ToolCallError>;
}

pub struct PlanHandler {
    backend: Arc<dyn PlanBackend>,
}

impl PlanHandler {
    #[must_use]
    pub fn new(backend: Arc<dyn PlanBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for PlanHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Plan
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let action = request.config_str("action");
        let scaffold = resolve_base_tool_scaffold(NodeType::Plan, action.as_deref());
        let operation = scaffold.operation.clone();
        let store_mode = request
            .config_str("store_mode")
            .unwrap_or_else(|| "replace".to_string());

        let config = ToolInvocationConfig::new(NodeType::Plan, scaffold.tool_name, operation.clone())
            .with_execution_id(request.execution_id)
            .with_request_id(request.request_id.clone())
            .with_correlation_id(request.correlation_id.clone())
            .with_idempotency_key(request.tool_idempotency_key(&operation));

        let backend = Arc::clone(&self.backend);
        let node_config = request.node.config.clone();
        let input_context = request.input_context.clone();
        let mode_owned = operation.clone();
        let store_mode_owned = store_mode.clone();
        let invoke = move || {
            let backend = Arc::clone(&backend);
            let node_config = node_config.clone();
            let input_context = input_context.clone();
            let mode = mode_owned.clone();
            let store_mode = store_mode_owned.clone();
            async move {
                let plan = backend
                    .execute(
                        &mode,
                        json!({
                            "config": node_config,
                            "input_context": input_context,
                            "store_mode": store_mode.clone(),
                        }),
                    )
                    .await?;
                let mut output = ensure_object(json!({
                    "node_type": "plan",
                    "mode": mode.clone(),
                    "store_mode": store_mode,
                    "action_results": [format!("{mode} applied")],
                }));
                output.insert("plan".into(), plan);
                Ok((Value::Object(output), json!({})))
            }
        };

        let validate: ToolValidate = Box::new(|output_state, routing_state| {
            validate_special_node_output(NodeType::Plan, output_state, routing_state)
                .map_err(|err| ToolCallError::msg(err.to_string()))
        });

        let outcome = invoke_deterministic_tool(config, invoke, Some(validate), None).await?;
        Ok(NodeHandlerOutput::new(outcome.output_state, outcome.routing_state))
    }
}
