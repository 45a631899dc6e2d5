//! RAG node handler.
//!
//! Modes: `query` (answer a question over the selected collections),
//! `fresh_index`, and `delta_index` (rebuild or update the collection
//! indexes). Collection validation happens at authoring time in
//! [`crate::model::validate_graph`]; this handler re-checks only what the
//! runtime can see.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{NodeError, NodeHandler, NodeHandlerOutput, NodeHandlerRequest};
use crate::contracts::RoutingOutput;
use crate::tooling::ToolCallError;
use crate::types::NodeType;

/// Seam over the external RAG service.
#[async_trait]
pub trait RagClient: Send + Sync {
    /// Answer a question over the selected collections.
    async fn query(&self, collections: &[String], question: &str)
    -> Result<Value, ToolCallError>;

    /// Run a `fresh_index` or `delta_index` pass over the collections.
    async fn index(&self, collections: &[String], mode: &str) -> Result<Value, ToolCallError>;
}

pub struct RagHandler {
    client: Arc<dyn RagClient>,
}

impl RagHandler {
    #[must_use]
    pub fn new(client: Arc<dyn RagClient>) -> Self {
        Self { client }
    }

    fn collections(request: &NodeHandlerRequest) -> Vec<String> {
        request
            .node
            .config
            .get("collections")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeHandler for RagHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Rag
    }

    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError> {
        let mode = request
            .config_str("mode")
            .ok_or_else(|| NodeError::ValidationFailed("rag node is missing mode".to_string()))?;
        let collections = Self::collections(&request);
        if collections.is_empty() {
            return Err(NodeError::ValidationFailed(
                "rag node has an empty collections list".to_string(),
            ));
        }

        let result = match mode.as_str() {
            "query" => {
                let question = request.config_str("question_prompt").ok_or_else(|| {
                    NodeError::ValidationFailed("rag query node is missing question_prompt".to_string())
                })?;
                self.client.query(&collections, &question).await
            }
            "fresh_index" | "delta_index" => self.client.index(&collections, &mode).await,
            other => {
                return Err(NodeError::ValidationFailed(format!(
                    "rag node has unknown mode '{other}'"
                )));
            }
        };

        let fragment = result.map_err(|_| NodeError::RagUnavailable {
            collections: collections.clone(),
        })?;

        let output_state = json!({
            "node_type": "rag",
            "mode": mode,
            "collections": collections,
            "result": fragment,
            "input_context": request.input_context,
            "output_state": {},
        });
        Ok(NodeHandlerOutput::new(
            output_state,
            RoutingOutput::new().into_value(),
        ))
    }
}
