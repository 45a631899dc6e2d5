//! Start and end node handlers.

use async_trait::async_trait;
use serde_json::json;

use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::contracts::RoutingOutput;
use crate::types::NodeType;

/// Identity passthrough; always succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct StartHandler;

impl StartHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let output_state = json!({
            "node_type": "start",
            "input_context": request.input_context,
            "output_state": {},
        });
        Ok(NodeHandlerOutput::new(
            output_state,
            RoutingOutput::new().into_value(),
        ))
    }
}

/// Terminal node; emits `terminate_run = true` unless the node config
/// explicitly opts out.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndHandler;

impl EndHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeHandler for EndHandler {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let terminate = request.config_bool("terminate_run", true);
        let output_state = json!({
            "node_type": "end",
            "input_context": request.input_context,
            "output_state": {},
        });
        Ok(NodeHandlerOutput::new(
            output_state,
            RoutingOutput::new().with_terminate_run(terminate).into_value(),
        ))
    }
}
