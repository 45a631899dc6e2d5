//! # llmctl-engine: Distributed Flowchart Execution Engine
//!
//! llmctl-engine runs user-authored directed graphs of typed nodes against
//! pluggable execution providers (an in-process workspace executor or a
//! Kubernetes Job per node) under strict versioned contracts.
//!
//! ## Core Concepts
//!
//! - **Flowcharts**: Directed graphs of typed nodes (start/end/task/decision/
//!   memory/milestone/plan/flowchart/rag) with solid (state-carrying) and
//!   dotted (context-only) edges
//! - **Runs**: One execution of a flowchart, with per-node execution records
//!   and contract-validated artifacts
//! - **Providers**: Dispatch targets selected by the execution router, with
//!   workspace-identity stamping and idempotent dispatch keys
//! - **Deterministic tooling**: Retry/fallback wrapper around special-node
//!   handlers, tracing every attempt
//! - **Realtime bus**: Sequenced, idempotent envelopes fanned out to
//!   subscribed rooms
//!
//! ## Quick Start
//!
//! ### Validating and routing a flowchart
//!
//! ```rust
//! use llmctl_engine::model::{Flowchart, FlowchartNode, FlowchartEdge, validate_graph};
//! use llmctl_engine::types::{EdgeMode, NodeType};
//! use serde_json::json;
//!
//! let flowchart = Flowchart {
//!     id: 1,
//!     name: "hello".into(),
//!     nodes: vec![
//!         FlowchartNode {
//!             id: 1,
//!             flowchart_id: 1,
//!             node_type: NodeType::Start,
//!             title: "Start".into(),
//!             config: json!({}),
//!             ref_id: None,
//!             model_id: None,
//!             position: None,
//!             skill_bindings: vec![],
//!         },
//!         FlowchartNode {
//!             id: 2,
//!             flowchart_id: 1,
//!             node_type: NodeType::End,
//!             title: "End".into(),
//!             config: json!({}),
//!             ref_id: None,
//!             model_id: None,
//!             position: None,
//!             skill_bindings: vec![],
//!         },
//!     ],
//!     edges: vec![FlowchartEdge {
//!         id: "e1".into(),
//!         source_node_id: 1,
//!         target_node_id: 2,
//!         edge_mode: EdgeMode::Solid,
//!         condition_key: None,
//!     }],
//! };
//! assert!(validate_graph(&flowchart, false).is_ok());
//! ```
//!
//! ### Emitting a contract event
//!
//! ```rust
//! use llmctl_engine::realtime::{EventSpec, RealtimeBus, flowchart_scope_rooms};
//!
//! let bus = RealtimeBus::new();
//! let envelope = bus
//!     .emit_contract_event(
//!         EventSpec::new("flowchart.run.updated", "flowchart_run", "7")
//!             .with_rooms(flowchart_scope_rooms(Some(1), Some(7), None)),
//!     )
//!     .unwrap();
//! assert_eq!(envelope.event_type, "flowchart:run:updated");
//! assert_eq!(envelope.sequence_stream, "flowchart_run:7");
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - Core enums: node types, edge modes, run lifecycle
//! - [`model`] - Flowchart entities and authoring-time graph validation
//! - [`contracts`] - Versioned envelopes, validators, and idempotency keys
//! - [`idempotency`] - Process-wide dispatch key registry
//! - [`tooling`] - Deterministic tooling framework for special nodes
//! - [`execution`] - Workspace/Kubernetes providers and the router
//! - [`instructions`] - Instruction package compiler and materializer
//! - [`skills`] - Skill resolution and adapter materialization
//! - [`nodes`] - Per-node-type handlers and their seams
//! - [`realtime`] - Sequenced realtime event bus
//! - [`runtimes`] - Settings, persistence, the run loop, and the scheduler
//! - [`telemetry`] - Tracing subscriber wiring for embedding processes

pub mod contracts;
pub mod execution;
pub mod idempotency;
pub mod instructions;
pub mod model;
pub mod nodes;
pub mod realtime;
pub mod runtimes;
pub mod skills;
pub mod telemetry;
pub mod tooling;
pub mod types;
pub mod utils;
