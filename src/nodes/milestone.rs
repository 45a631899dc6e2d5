//! Milestone node handler.

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

/// Seam over the milestone store.
///
/// `action` is `create_or_update` or `mark_complete`; the returned object is
/// the affected milestone record.
#[async_trait]
pub trait MilestoneBackend: Send + Sync {
    async fn execute(&self, action: &str, payload: Value) -> Result<Value, ToolCallError>;
}

pub struct MilestoneHandler {
    backend: Arc<dyn MilestoneBackend>,
}

impl MilestoneHandler {
    #[must_use]
    pub fn new(backend: Arc<dyn MilestoneBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for MilestoneHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Milestone
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let action = request.config_str("action");
        let scaffold = resolve_base_tool_scaffold(NodeType::Milestone, action.as_deref());
        let operation = scaffold.operation.clone();

        let config =
            ToolInvocationConfig::new(NodeType::Milestone, scaffold.tool_name, operation.clone())
                .with_execution_id(request.execution_id)
                .with_request_id(request.request_id.clone())
                .with_correlation_id(request.correlation_id.clone())
                .with_idempotency_key(request.tool_idempotency_key(&operation));

        let backend = Arc::clone(&self.backend);
        let node_config = request.node.config.clone();
        let input_context = request.input_context.clone();
        let action_owned = operation.clone();
        let invoke = move || {
            let backend = Arc::clone(&backend);
            let node_config = node_config.clone();
            let input_context = input_context.clone();
            let action = action_owned.clone();
            async move {
                let milestone = backend
                    .execute(
                        &action,
                        json!({"config": node_config, "input_context": input_context}),
                    )
                    .await?;
                let mut output = ensure_object(json!({
                    "node_type": "milestone",
                    "action": action.clone(),
                    "action_results": [format!("{action} applied")],
                }));
                output.insert("milestone".into(), milestone);
                Ok((Value::Object(output), json!({})))
            }
        };

        let validate: ToolValidate = Box::new(|output_state, routing_state| {
            validate_special_node_output(NodeType::Milestone, output_state, routing_state)
                .map_err(|err| ToolCallError::msg(err.to_string()))
        });

        let outcome = invoke_deterministic_tool(config, invoke, Some(validate), None).await?;
        Ok(NodeHandlerOutput::new(outcome.output_state, outcome.routing_state))
    }
}
