//! Flowchart data model and authoring-time graph validation.
//!
//! Entities here are the semantic shapes shared by the run loop, the node
//! runtime, and the persistence adapter. Authoring entities (flowcharts,
//! nodes, edges, skills, agents) are shared-read by runs; a run exclusively
//! owns its [`FlowchartRunNode`] and [`NodeArtifact`] rows.
//!
//! Cross-entity references are ids, never object references, so the model
//! serializes cleanly and crosses process boundaries without cycles.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    AgentId, ArtifactType, EdgeMode, FlowchartId, NodeId, NodeRunId, NodeType, RunId, RunStatus,
    SkillId, SkillVersionId,
};

// ============================================================================
// Authoring entities
// ============================================================================

/// One branch condition carried by a decision node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCondition {
    /// Edge id this condition routes to when matched.
    pub connector_id: String,
    /// Free-text condition evaluated against upstream outputs.
    pub condition_text: String,
}

/// Typed vertex of a flowchart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowchartNode {
    pub id: NodeId,
    pub flowchart_id: FlowchartId,
    pub node_type: NodeType,
    pub title: String,
    /// Free-form per-node configuration (JSON object).
    #[serde(default)]
    pub config: Value,
    /// Optional reference to an authoring template (e.g. a task template).
    #[serde(default)]
    pub ref_id: Option<i64>,
    /// Optional model override for LLM-backed nodes.
    #[serde(default)]
    pub model_id: Option<i64>,
    /// Optional canvas position, carried for the authoring surface.
    #[serde(default)]
    pub position: Option<(f64, f64)>,
    /// Ordered skill bindings attached directly to this node.
    #[serde(default)]
    pub skill_bindings: Vec<SkillBinding>,
}

impl FlowchartNode {
    /// Decision conditions parsed out of `config.decision_conditions`.
    #[must_use]
    pub fn decision_conditions(&self) -> Vec<DecisionCondition> {
        self.config
            .get("decision_conditions")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let connector_id = entry.get("connector_id")?.as_str()?.trim();
                        let condition_text =
                            entry.get("condition_text").and_then(Value::as_str).unwrap_or("");
                        if connector_id.is_empty() {
                            return None;
                        }
                        Some(DecisionCondition {
                            connector_id: connector_id.to_string(),
                            condition_text: condition_text.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// String value from `config`, trimmed, `None` when blank or absent.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<String> {
        let text = self.config.get(key)?.as_str()?.trim();
        if text.is_empty() { None } else { Some(text.to_string()) }
    }
}

/// Directed edge between two flowchart nodes.
///
/// `condition_key` is only legal on edges whose source is a decision node;
/// [`validate_graph`] enforces the policy gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowchartEdge {
    /// Connector id referenced by decision `matched_connector_ids`.
    pub id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub edge_mode: EdgeMode,
    #[serde(default)]
    pub condition_key: Option<String>,
}

/// User-authored directed graph of typed nodes.
///
/// Mutable through the authoring API, immutable for the duration of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flowchart {
    pub id: FlowchartId,
    pub name: String,
    pub nodes: Vec<FlowchartNode>,
    pub edges: Vec<FlowchartEdge>,
}

impl Flowchart {
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&FlowchartNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// The unique start node. Only meaningful after [`validate_graph`].
    #[must_use]
    pub fn start_node(&self) -> Option<&FlowchartNode> {
        self.nodes.iter().find(|node| node.node_type.is_start())
    }

    /// Outgoing edges of `node_id` in authoring order.
    #[must_use]
    pub fn outgoing(&self, node_id: NodeId) -> Vec<&FlowchartEdge> {
        self.edges
            .iter()
            .filter(|edge| edge.source_node_id == node_id)
            .collect()
    }

    /// Incoming edges of `node_id` in authoring order.
    #[must_use]
    pub fn incoming(&self, node_id: NodeId) -> Vec<&FlowchartEdge> {
        self.edges
            .iter()
            .filter(|edge| edge.target_node_id == node_id)
            .collect()
    }
}

// ============================================================================
// Run entities
// ============================================================================

/// One execution of a flowchart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowchartRun {
    pub id: RunId,
    pub flowchart_id: FlowchartId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Populated on replay runs with the run they were enqueued from.
    #[serde(default)]
    pub replay_of: Option<RunId>,
}

/// One execution of a node within a run.
///
/// Field groups mirror the on-wire run metadata schema plus the resolved
/// instruction/skill context; the record lives exactly as long as its run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlowchartRunNode {
    pub id: NodeRunId,
    pub flowchart_run_id: RunId,
    pub flowchart_node_id: NodeId,
    pub execution_index: u32,
    pub status: String,
    #[serde(default)]
    pub input_context: Value,
    #[serde(default)]
    pub output_state: Value,
    #[serde(default)]
    pub routing_state: Value,
    #[serde(default)]
    pub degraded_status: bool,
    #[serde(default)]
    pub degraded_reason: Option<String>,
    #[serde(default)]
    pub resolved_agent_id: Option<AgentId>,
    #[serde(default)]
    pub resolved_role_id: Option<i64>,
    #[serde(default)]
    pub resolved_instruction_manifest_hash: Option<String>,
    #[serde(default)]
    pub instruction_materialized_paths: Vec<String>,
    #[serde(default)]
    pub selected_provider: Option<String>,
    #[serde(default)]
    pub final_provider: Option<String>,
    #[serde(default)]
    pub provider_dispatch_id: Option<String>,
    #[serde(default)]
    pub workspace_identity: Option<String>,
    #[serde(default)]
    pub dispatch_status: Option<String>,
    #[serde(default)]
    pub fallback_attempted: bool,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub dispatch_uncertain: bool,
    #[serde(default)]
    pub api_failure_category: Option<String>,
    #[serde(default)]
    pub cli_fallback_used: bool,
    #[serde(default)]
    pub cli_preflight_passed: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Typed, contract-validated payload emitted per node run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeArtifact {
    pub id: i64,
    pub flowchart_id: FlowchartId,
    pub flowchart_node_id: NodeId,
    pub flowchart_run_id: RunId,
    pub flowchart_run_node_id: NodeRunId,
    pub node_type: NodeType,
    pub artifact_type: ArtifactType,
    pub payload: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub variant_key: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Skill / agent authoring entities
// ============================================================================

/// A single file within a skill version. Content is UTF-8 text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillFile {
    pub path: String,
    pub content: String,
    /// SHA-256 of the decoded content; recomputed when blank.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Append-only version of a skill.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillVersion {
    pub id: SkillVersionId,
    pub skill_id: SkillId,
    pub version: String,
    /// Stored manifest hash; when blank, derived from the file set.
    #[serde(default)]
    pub manifest_hash: String,
    pub files: Vec<SkillFile>,
}

/// Authoring skill with its append-only versions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub versions: Vec<SkillVersion>,
}

/// Ordered binding of a skill to an agent or flowchart node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SkillBinding {
    pub skill_id: SkillId,
    #[serde(default)]
    pub position: Option<i64>,
}

/// Authoring agent consumed by the instruction compiler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub role_id: Option<i64>,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub skill_bindings: Vec<SkillBinding>,
}

/// Authoring role consumed by the instruction compiler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub markdown: String,
}

/// `(provider, key) -> value` runtime setting row.
///
/// Values flagged secret are stored ciphered (`enc:v1:` prefix) and never
/// leave the runtime loader in clear text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrationSetting {
    pub provider: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

/// RAG source tracked by the background scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RagSource {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub next_index_at: Option<DateTime<Utc>>,
    pub cadence_value: u32,
    pub cadence_unit: String,
    #[serde(default)]
    pub active_job: bool,
}

// ============================================================================
// Graph validation
// ============================================================================

/// Authoring-time graph violations.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("flowchart must contain exactly one start node, found {count}")]
    #[diagnostic(
        code(llmctl_engine::graph::start_count),
        help("Add or remove start nodes until exactly one remains.")
    )]
    StartCount { count: usize },

    #[error("edge '{edge_id}' references missing node {node_id}")]
    #[diagnostic(code(llmctl_engine::graph::dangling_edge))]
    DanglingEdge { edge_id: String, node_id: NodeId },

    #[error("edge '{edge_id}' carries condition_key but its source is not a decision node")]
    #[diagnostic(
        code(llmctl_engine::graph::condition_on_non_decision),
        help("condition_key is only allowed when the edge source is a decision node.")
    )]
    ConditionOnNonDecision { edge_id: String },

    #[error("decision node {node_id} needs decision_conditions or route_field_path")]
    #[diagnostic(code(llmctl_engine::graph::decision_config))]
    DecisionConfig { node_id: NodeId },

    #[error("{node_type} node {node_id} is missing required config key '{key}'")]
    #[diagnostic(code(llmctl_engine::graph::node_config))]
    NodeConfig {
        node_id: NodeId,
        node_type: NodeType,
        key: &'static str,
    },

    #[error("rag node {node_id} has an empty collections list")]
    #[diagnostic(code(llmctl_engine::graph::rag_collections))]
    RagCollections { node_id: NodeId },

    #[error("rag node {node_id} uses mode '{mode}' which requires an embedding-capable model provider")]
    #[diagnostic(code(llmctl_engine::graph::rag_embedding))]
    RagEmbedding { node_id: NodeId, mode: String },

    #[error("rag node {node_id} uses unknown mode '{mode}'")]
    #[diagnostic(code(llmctl_engine::graph::rag_mode))]
    RagMode { node_id: NodeId, mode: String },
}

/// Validate a flowchart for execution.
///
/// Checks the exactly-one-start invariant, that every edge references
/// existing endpoints, the decision-only `condition_key` policy gate, and
/// per-type config invariants. `embedding_capable` reflects whether the
/// configured model provider can embed; RAG index modes require it.
pub fn validate_graph(flowchart: &Flowchart, embedding_capable: bool) -> Result<(), GraphError> {
    let start_count = flowchart
        .nodes
        .iter()
        .filter(|node| node.node_type.is_start())
        .count();
    if start_count != 1 {
        return Err(GraphError::StartCount { count: start_count });
    }

    for edge in &flowchart.edges {
        for endpoint in [edge.source_node_id, edge.target_node_id] {
            if flowchart.node(endpoint).is_none() {
                return Err(GraphError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: endpoint,
                });
            }
        }
        if edge.condition_key.is_some() {
            let source_is_decision = flowchart
                .node(edge.source_node_id)
                .map(|node| node.node_type == NodeType::Decision)
                .unwrap_or(false);
            if !source_is_decision {
                return Err(GraphError::ConditionOnNonDecision {
                    edge_id: edge.id.clone(),
                });
            }
        }
    }

    for node in &flowchart.nodes {
        validate_node_config(node, embedding_capable)?;
    }

    Ok(())
}

fn validate_node_config(node: &FlowchartNode, embedding_capable: bool) -> Result<(), GraphError> {
    match node.node_type {
        NodeType::Decision => {
            if node.decision_conditions().is_empty() && node.config_str("route_field_path").is_none()
            {
                return Err(GraphError::DecisionConfig { node_id: node.id });
            }
        }
        NodeType::Memory | NodeType::Milestone | NodeType::Plan => {
            if node.config_str("action").is_none() {
                return Err(GraphError::NodeConfig {
                    node_id: node.id,
                    node_type: node.node_type,
                    key: "action",
                });
            }
        }
        NodeType::Rag => {
            let mode = node.config_str("mode").ok_or(GraphError::NodeConfig {
                node_id: node.id,
                node_type: node.node_type,
                key: "mode",
            })?;
            let collections = node
                .config
                .get("collections")
                .and_then(Value::as_array)
                .map(|items| !items.is_empty())
                .unwrap_or(false);
            if !collections {
                return Err(GraphError::RagCollections { node_id: node.id });
            }
            match mode.as_str() {
                "query" => {
                    if node.config_str("question_prompt").is_none() {
                        return Err(GraphError::NodeConfig {
                            node_id: node.id,
                            node_type: node.node_type,
                            key: "question_prompt",
                        });
                    }
                }
                "fresh_index" | "delta_index" => {
                    if !embedding_capable {
                        return Err(GraphError::RagEmbedding {
                            node_id: node.id,
                            mode,
                        });
                    }
                }
                _ => {
                    return Err(GraphError::RagMode {
                        node_id: node.id,
                        mode,
                    });
                }
            }
        }
        NodeType::Start | NodeType::End | NodeType::Task | NodeType::Flowchart => {}
    }
    Ok(())
}
