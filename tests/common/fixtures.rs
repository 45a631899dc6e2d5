//! Flowchart and runner fixtures.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};

use llmctl_engine::execution::{ExecutionProvider, ExecutionRouter, RouterSettings, WorkspaceExecutor};
use llmctl_engine::model::{Flowchart, FlowchartEdge, FlowchartNode};
use llmctl_engine::nodes::NodeHandlerRegistry;
use llmctl_engine::realtime::{MemorySink, RealtimeBus};
use llmctl_engine::runtimes::runner::AuthoringCatalog;
use llmctl_engine::runtimes::{FlowchartRunner, InMemoryRunStore, RuntimeSettings};
use llmctl_engine::types::{EdgeMode, NodeId, NodeType};

use super::stubs::{StubMemoryBackend, StubMilestoneBackend, StubModel, StubPlanBackend, StubRag};

pub fn node(id: NodeId, node_type: NodeType, config: Value) -> FlowchartNode {
    FlowchartNode {
        id,
        flowchart_id: 0,
        node_type,
        title: format!("node-{id}"),
        config,
        ref_id: None,
        model_id: None,
        position: None,
        skill_bindings: Vec::new(),
    }
}

pub fn solid_edge(id: &str, from: NodeId, to: NodeId) -> FlowchartEdge {
    FlowchartEdge {
        id: id.to_string(),
        source_node_id: from,
        target_node_id: to,
        edge_mode: EdgeMode::Solid,
        condition_key: None,
    }
}

pub fn conditional_edge(id: &str, from: NodeId, to: NodeId, condition_key: &str) -> FlowchartEdge {
    FlowchartEdge {
        id: id.to_string(),
        source_node_id: from,
        target_node_id: to,
        edge_mode: EdgeMode::Solid,
        condition_key: Some(condition_key.to_string()),
    }
}

/// `start -> end` over one solid edge.
pub fn minimal_flowchart() -> Flowchart {
    Flowchart {
        id: 0,
        name: "minimal".into(),
        nodes: vec![
            node(1, NodeType::Start, json!({})),
            node(2, NodeType::End, json!({})),
        ],
        edges: vec![solid_edge("e1", 1, 2)],
    }
}

pub struct TestRig {
    pub runner: FlowchartRunner,
    pub store: Arc<InMemoryRunStore>,
    pub sink: MemorySink,
    pub memory: Arc<StubMemoryBackend>,
    pub model: Arc<StubModel>,
    pub workspace_dir: tempfile::TempDir,
}

/// Runner over the in-memory store with the workspace provider and a memory
/// sink attached to the bus.
pub fn workspace_rig() -> TestRig {
    rig_with_settings(RuntimeSettings::new(), "workspace")
}

pub fn rig_with_settings(settings: RuntimeSettings, provider: &str) -> TestRig {
    let store = Arc::new(InMemoryRunStore::new());
    let model = Arc::new(StubModel::default());
    let memory = Arc::new(StubMemoryBackend::default());
    let registry = Arc::new(NodeHandlerRegistry::with_defaults(
        model.clone(),
        memory.clone(),
        Arc::new(StubMilestoneBackend::default()),
        Arc::new(StubPlanBackend::default()),
        Arc::new(StubRag::default()),
    ));
    let workspace: Arc<dyn ExecutionProvider> = Arc::new(WorkspaceExecutor::new());
    let router_settings = RouterSettings {
        provider: provider.to_string(),
        workspace_identity_key: settings.router_settings().workspace_identity_key,
        workspace_fallback_enabled: false,
    };
    // Tests never reach the kubernetes provider; the workspace executor
    // stands in for both slots.
    let router = Arc::new(ExecutionRouter::new(
        router_settings,
        workspace.clone(),
        workspace,
    ));
    let sink = MemorySink::new();
    let bus = Arc::new(RealtimeBus::with_sink(sink.clone()));
    bus.listen_for_events();

    let workspace_dir = tempfile::tempdir().expect("tempdir");
    let workspaces: PathBuf = workspace_dir.path().join("workspaces");
    let homes: PathBuf = workspace_dir.path().join("homes");
    let runner = FlowchartRunner::new(
        store.clone(),
        registry,
        router,
        bus,
        settings,
        Arc::new(AuthoringCatalog::new()),
        workspaces,
        homes,
    );
    TestRig {
        runner,
        store,
        sink,
        memory,
        model,
        workspace_dir,
    }
}
