//! Core types for the llmctl execution engine.
//!
//! This module defines the fundamental identifiers used throughout the engine
//! for classifying flowchart vertices, edges, runs, and artifacts. These are
//! the domain concepts that define what a flowchart *is*.
//!
//! For runtime execution shapes (dispatch metadata, execution requests), see
//! [`crate::execution`].
//!
//! # Key Types
//!
//! - [`NodeType`]: Identifies the typed vertices of a flowchart graph
//! - [`EdgeMode`]: Distinguishes state-carrying edges from context-only edges
//! - [`RunStatus`]: Lifecycle of a [`crate::model::FlowchartRun`]
//! - [`ArtifactType`]: Classifies contract-validated node artifacts
//!
//! # Examples
//!
//! ```rust
//! use llmctl_engine::types::{NodeType, RunStatus};
//!
//! let decision = NodeType::Decision;
//! assert_eq!(decision.encode(), "decision");
//! assert_eq!(NodeType::decode("decision"), Some(NodeType::Decision));
//!
//! assert!(!RunStatus::Paused.is_terminal());
//! assert!(RunStatus::Cancelled.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Flowchart database identifier.
pub type FlowchartId = i64;
/// Flowchart node database identifier.
pub type NodeId = i64;
/// Flowchart run database identifier.
pub type RunId = i64;
/// Flowchart run-node database identifier.
pub type NodeRunId = i64;
/// Node artifact database identifier.
pub type ArtifactId = i64;
/// Skill database identifier.
pub type SkillId = i64;
/// Skill version database identifier.
pub type SkillVersionId = i64;
/// Agent database identifier.
pub type AgentId = i64;

/// Identifies the type of a vertex within a flowchart graph.
///
/// Every flowchart carries exactly one [`Start`](Self::Start) node and zero or
/// more [`End`](Self::End) nodes; the remaining variants map one-to-one onto
/// node handlers in [`crate::nodes`].
///
/// # Persistence
///
/// `NodeType` serializes as its lowercase string form through both serde and
/// the [`encode`](Self::encode)/[`decode`](Self::decode) methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Entry point that begins flowchart execution. Exactly one per graph.
    Start,
    /// Terminal vertex; emits `terminate_run` by default.
    End,
    /// LLM-backed task executed through an execution provider.
    Task,
    /// Deterministic routing vertex producing matched connector ids.
    Decision,
    /// Memory add/retrieve/delete vertex with deterministic and LLM-guided modes.
    Memory,
    /// Milestone create-or-update / mark-complete vertex.
    Milestone,
    /// Plan create-or-update / complete-item vertex.
    Plan,
    /// Recursive sub-flowchart invocation.
    Flowchart,
    /// Retrieval-augmented generation vertex (query or index modes).
    Rag,
}

impl NodeType {
    /// All node types, in artifact-table order.
    pub const ALL: [NodeType; 9] = [
        NodeType::Start,
        NodeType::End,
        NodeType::Task,
        NodeType::Decision,
        NodeType::Memory,
        NodeType::Milestone,
        NodeType::Plan,
        NodeType::Flowchart,
        NodeType::Rag,
    ];

    /// Encode a `NodeType` into its persisted lowercase string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Task => "task",
            NodeType::Decision => "decision",
            NodeType::Memory => "memory",
            NodeType::Milestone => "milestone",
            NodeType::Plan => "plan",
            NodeType::Flowchart => "flowchart",
            NodeType::Rag => "rag",
        }
    }

    /// Decode a persisted string form back into a `NodeType`.
    ///
    /// Decoding is case-insensitive and tolerates surrounding whitespace;
    /// unknown strings return `None` rather than panicking so callers can
    /// surface a validation error.
    pub fn decode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Some(NodeType::Start),
            "end" => Some(NodeType::End),
            "task" => Some(NodeType::Task),
            "decision" => Some(NodeType::Decision),
            "memory" => Some(NodeType::Memory),
            "milestone" => Some(NodeType::Milestone),
            "plan" => Some(NodeType::Plan),
            "flowchart" => Some(NodeType::Flowchart),
            "rag" => Some(NodeType::Rag),
            _ => None,
        }
    }

    /// Returns `true` for the deterministic special nodes wrapped by the
    /// tooling framework (decision/memory/milestone/plan).
    #[must_use]
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            NodeType::Decision | NodeType::Memory | NodeType::Milestone | NodeType::Plan
        )
    }

    /// Returns `true` if this is the [`Start`](Self::Start) node type.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Returns `true` if this is the [`End`](Self::End) node type.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Identifies the mode of a flowchart edge.
///
/// `Solid` edges carry forward state between nodes; `Dotted` edges contribute
/// context only and never drive frontier advancement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    Solid,
    Dotted,
}

impl EdgeMode {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            EdgeMode::Solid => "solid",
            EdgeMode::Dotted => "dotted",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solid" => Some(EdgeMode::Solid),
            "dotted" => Some(EdgeMode::Dotted),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Lifecycle of a flowchart run.
///
/// `Pausing` is a transient state: a pause request against a running run
/// settles into `Paused` at the next handler boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Pausing,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Pausing => "pausing",
            RunStatus::Paused => "paused",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "pausing" => Some(RunStatus::Pausing),
            "paused" => Some(RunStatus::Paused),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns `true` once the run can no longer consume nodes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Returns `true` while the run is eligible for the run loop.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Running | RunStatus::Pausing
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Classifies a contract-validated node artifact.
///
/// Artifact types mirror node types one-to-one; the split exists because the
/// contract validator keys its required-field table on the artifact rather
/// than the vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Start,
    End,
    Task,
    Decision,
    Memory,
    Milestone,
    Plan,
    Flowchart,
    Rag,
}

impl ArtifactType {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ArtifactType::Start => "start",
            ArtifactType::End => "end",
            ArtifactType::Task => "task",
            ArtifactType::Decision => "decision",
            ArtifactType::Memory => "memory",
            ArtifactType::Milestone => "milestone",
            ArtifactType::Plan => "plan",
            ArtifactType::Flowchart => "flowchart",
            ArtifactType::Rag => "rag",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Some(ArtifactType::Start),
            "end" => Some(ArtifactType::End),
            "task" => Some(ArtifactType::Task),
            "decision" => Some(ArtifactType::Decision),
            "memory" => Some(ArtifactType::Memory),
            "milestone" => Some(ArtifactType::Milestone),
            "plan" => Some(ArtifactType::Plan),
            "flowchart" => Some(ArtifactType::Flowchart),
            "rag" => Some(ArtifactType::Rag),
            _ => None,
        }
    }
}

impl From<NodeType> for ArtifactType {
    fn from(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Start => ArtifactType::Start,
            NodeType::End => ArtifactType::End,
            NodeType::Task => ArtifactType::Task,
            NodeType::Decision => ArtifactType::Decision,
            NodeType::Memory => ArtifactType::Memory,
            NodeType::Milestone => ArtifactType::Milestone,
            NodeType::Plan => ArtifactType::Plan,
            NodeType::Flowchart => ArtifactType::Flowchart,
            NodeType::Rag => ArtifactType::Rag,
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
