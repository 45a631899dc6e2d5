//! Node runtime: per-node-type handlers and their wiring seams.
//!
//! Every handler turns `(node, input_context)` into an
//! `(output_state, routing_state)` pair. Dispatch is a registry keyed by
//! [`NodeType`], wired once at process start; there is no dynamic class
//! dispatch anywhere in the engine.
//!
//! External collaborators (LLM SDKs, the memory tool, the RAG service) appear
//! only as the [`ModelInvoker`], [`MemoryBackend`], [`MilestoneBackend`],
//! [`PlanBackend`], and [`RagClient`] traits; the engine never links a
//! provider SDK.

pub mod decision;
pub mod memory;
pub mod milestone;
pub mod passthrough;
pub mod plan;
pub mod rag;
pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::contracts::ContractError;
use crate::model::FlowchartNode;
use crate::tooling::{ToolCallError, ToolingError};
use crate::types::NodeType;

pub use decision::DecisionHandler;
pub use memory::{MemoryBackend, MemoryHandler};
pub use milestone::{MilestoneBackend, MilestoneHandler};
pub use passthrough::{EndHandler, StartHandler};
pub use plan::{PlanBackend, PlanHandler};
pub use rag::{RagClient, RagHandler};
pub use task::{ModelInvoker, TaskHandler};

// ============================================================================
// Request / output shapes
// ============================================================================

/// Per-execution request handed to a node handler.
#[derive(Clone, Debug)]
pub struct NodeHandlerRequest {
    pub node: FlowchartNode,
    pub input_context: Value,
    /// Node-run identifier; unique per execution.
    pub execution_id: i64,
    pub execution_index: u32,
    pub request_id: String,
    pub correlation_id: String,
}

impl NodeHandlerRequest {
    /// Trimmed string value from the node config.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<String> {
        self.node.config_str(key)
    }

    /// Boolean config value with string coercion (`"true"`, `"1"`, …).
    #[must_use]
    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        match self.node.config.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(default),
            _ => default,
        }
    }

    /// Unsigned config value with string coercion.
    #[must_use]
    pub fn config_u32(&self, key: &str, default: u32) -> u32 {
        match self.node.config.get(key) {
            Some(Value::Number(n)) => n.as_u64().map(|v| v as u32).unwrap_or(default),
            Some(Value::String(raw)) => raw.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Idempotency key for the deterministic tool wrapping this execution.
    #[must_use]
    pub fn tool_idempotency_key(&self, operation: &str) -> String {
        format!(
            "deterministic:{}:{}:{operation}",
            self.node.node_type.encode(),
            self.execution_id
        )
    }
}

/// `(output_state, routing_state)` produced by a handler.
#[derive(Clone, Debug, Default)]
pub struct NodeHandlerOutput {
    pub output_state: Value,
    pub routing_state: Value,
}

impl NodeHandlerOutput {
    #[must_use]
    pub fn new(output_state: Value, routing_state: Value) -> Self {
        Self {
            output_state,
            routing_state,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fatal errors that halt a node execution.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("node validation failed: {0}")]
    #[diagnostic(code(llmctl_engine::nodes::validation))]
    ValidationFailed(String),

    #[error("node execution failed: {0}")]
    #[diagnostic(code(llmctl_engine::nodes::execution))]
    Execution(#[source] ToolCallError),

    #[error("fallback_runtime_error: both primary and fallback modes failed ({primary}; {fallback})")]
    #[diagnostic(
        code(llmctl_engine::nodes::fallback_runtime),
        help("Inspect the node trace for the primary and fallback failure reasons.")
    )]
    FallbackRuntime { primary: String, fallback: String },

    #[error("model invocation failed: {0}")]
    #[diagnostic(code(llmctl_engine::nodes::model))]
    Model(String),

    #[error("RAG service unreachable for collections {collections:?}")]
    #[diagnostic(
        code(llmctl_engine::nodes::rag_unavailable),
        help("Surfaced to callers as RAG_UNAVAILABLE_FOR_SELECTED_COLLECTIONS.")
    )]
    RagUnavailable { collections: Vec<String> },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tooling(#[from] ToolingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    #[diagnostic(code(llmctl_engine::nodes::serde))]
    Serde(#[from] serde_json::Error),

    #[error("no handler registered for node type '{node_type}'")]
    #[diagnostic(code(llmctl_engine::nodes::unregistered))]
    Unregistered { node_type: NodeType },
}

/// API error code for unreachable RAG collections.
pub const RAG_UNAVAILABLE_CODE: &str = "RAG_UNAVAILABLE_FOR_SELECTED_COLLECTIONS";

// ============================================================================
// Handler trait & registry
// ============================================================================

/// One node type's execution logic.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler serves.
    fn node_type(&self) -> NodeType;

    /// Execute one node.
    async fn handle(&self, request: NodeHandlerRequest) -> Result<NodeHandlerOutput, NodeError>;
}

/// Registry keyed by node type, wired at process start.
#[derive(Default)]
pub struct NodeHandlerRegistry {
    handlers: FxHashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl NodeHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the standard handler set over the given seams.
    ///
    /// The `flowchart` node type is intentionally absent: sub-runs are
    /// executed by the runner itself to keep the registry acyclic.
    #[must_use]
    pub fn with_defaults(
        model: Arc<dyn ModelInvoker>,
        memory: Arc<dyn MemoryBackend>,
        milestones: Arc<dyn MilestoneBackend>,
        plans: Arc<dyn PlanBackend>,
        rag: Arc<dyn RagClient>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StartHandler::new()));
        registry.register(Arc::new(EndHandler::new()));
        registry.register(Arc::new(TaskHandler::new(Arc::clone(&model))));
        registry.register(Arc::new(DecisionHandler::new()));
        registry.register(Arc::new(MemoryHandler::new(memory, model)));
        registry.register(Arc::new(MilestoneHandler::new(milestones)));
        registry.register(Arc::new(PlanHandler::new(plans)));
        registry.register(Arc::new(RagHandler::new(rag)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type(), handler);
    }

    #[must_use]
    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    pub fn require(&self, node_type: NodeType) -> Result<Arc<dyn NodeHandler>, NodeError> {
        self.get(node_type)
            .ok_or(NodeError::Unregistered { node_type })
    }
}

// ============================================================================
// Artifact payload assembly
// ============================================================================

/// Build the contract-shaped artifact payload for a completed node run.
///
/// Special node types project their required keys out of the output state;
/// every payload carries the routing state.
#[must_use]
pub fn build_artifact_payload(
    node_type: NodeType,
    input_context: &Value,
    output_state: &Value,
    routing_state: &Value,
) -> Value {
    let get = |key: &str, default: Value| -> Value {
        output_state.get(key).cloned().unwrap_or(default)
    };
    match node_type {
        NodeType::Decision => json!({
            "matched_connector_ids": get("matched_connector_ids", json!([])),
            "evaluations": get("evaluations", json!([])),
            "no_match": get("no_match", json!(false)),
            "routing_state": routing_state,
        }),
        NodeType::Memory => json!({
            "action": get("action", json!("")),
            "action_results": get("action_results", json!([])),
            "routing_state": routing_state,
        }),
        NodeType::Milestone => json!({
            "action": get("action", json!("")),
            "action_results": get("action_results", json!([])),
            "milestone": get("milestone", Value::Object(Map::new())),
            "routing_state": routing_state,
        }),
        NodeType::Plan => json!({
            "mode": get("mode", json!("")),
            "store_mode": get("store_mode", json!("")),
            "action_results": get("action_results", json!([])),
            "plan": get("plan", Value::Object(Map::new())),
            "routing_state": routing_state,
        }),
        NodeType::Start
        | NodeType::End
        | NodeType::Task
        | NodeType::Flowchart
        | NodeType::Rag => json!({
            "node_type": node_type.encode(),
            "input_context": input_context,
            "output_state": output_state,
            "routing_state": routing_state,
        }),
    }
}
