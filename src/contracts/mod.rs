//! Versioned runtime contracts shared by every subsystem.
//!
//! All runtime shapes carry `contract_version = "v1"`. The module is split
//! into [`envelopes`] (node output / routing / artifact / API error shapes and
//! their validators), [`events`] (socket event envelope and canonical event
//! type normalization), and [`keys`] (deterministic idempotency key builders).

pub mod envelopes;
pub mod events;
pub mod keys;

pub use envelopes::{
    ApiError, ApiErrorEnvelope, ContractError, DispatchStatus, RoutingOutput, RunMetadata,
    normalize_run_metadata, resolve_node_degraded_markers, validate_artifact_payload,
    validate_node_output, validate_routing_output, validate_special_node_output,
};
pub use events::{SocketEventEnvelope, canonical_socket_event_type};
pub use keys::{
    dispatch_idempotency_key, node_artifact_idempotency_key, node_run_idempotency_key,
};

/// Contract version stamped on every runtime shape.
pub const CONTRACT_VERSION: &str = "v1";

/// Version of the artifact payload layout within the v1 contract.
pub const ARTIFACT_PAYLOAD_VERSION: u32 = 1;
