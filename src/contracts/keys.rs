//! Deterministic idempotency key builders.
//!
//! Keys are plain strings so the registry stays storage-agnostic. Callers
//! that need expiry encode it into the key.

use crate::types::{ArtifactType, NodeId, NodeRunId, RunId};

/// Key for one execution of a node within a run.
#[must_use]
pub fn node_run_idempotency_key(
    flowchart_run_id: RunId,
    flowchart_node_id: NodeId,
    execution_index: u32,
) -> String {
    format!(
        "flowchart_run:{flowchart_run_id}:flowchart_node:{flowchart_node_id}:execution:{execution_index}"
    )
}

/// Key for one artifact emitted by a node run.
#[must_use]
pub fn node_artifact_idempotency_key(
    flowchart_run_id: RunId,
    flowchart_run_node_id: NodeRunId,
    artifact_type: ArtifactType,
) -> String {
    format!(
        "flowchart_run:{flowchart_run_id}:node_run:{flowchart_run_node_id}:artifact:{}",
        artifact_type.encode()
    )
}

/// Key for one provider dispatch.
#[must_use]
pub fn dispatch_idempotency_key(provider: &str, execution_id: i64) -> String {
    format!("{provider}:{execution_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(
            node_run_idempotency_key(7, 3, 2),
            "flowchart_run:7:flowchart_node:3:execution:2"
        );
        assert_eq!(
            node_artifact_idempotency_key(7, 41, ArtifactType::Decision),
            "flowchart_run:7:node_run:41:artifact:decision"
        );
        assert_eq!(dispatch_idempotency_key("workspace", 99), "workspace:99");
    }
}
