//! Persistence adapter: the [`RunStore`] capability and its in-memory
//! implementation.
//!
//! Each write method is one unit of work: everything inside commits together
//! or not at all, and callers emit realtime events only after a method
//! returns `Ok`, never from inside a scope. The SQLite implementation in
//! [`super::store_sqlite`] mirrors this trait over real transactions.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::model::{Flowchart, FlowchartRun, FlowchartRunNode, NodeArtifact, RagSource};
use crate::types::{FlowchartId, NodeRunId, RunId, RunStatus};

/// Persistence failures.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    #[diagnostic(code(llmctl_engine::store::not_found))]
    NotFound { entity: &'static str, id: i64 },

    #[error("duplicate {entity} idempotency key: {key}")]
    #[diagnostic(
        code(llmctl_engine::store::conflict),
        help("Idempotency keys must be unique; the write was rolled back.")
    )]
    Conflict { entity: &'static str, key: String },

    #[error("store backend error: {message}")]
    #[diagnostic(code(llmctl_engine::store::backend))]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(code(llmctl_engine::store::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a keyed replay request.
#[derive(Clone, Debug)]
pub struct ReplayOutcome {
    pub replay_run: FlowchartRun,
    /// `true` when the key had already enqueued a replay.
    pub existing: bool,
}

/// Unit-of-work persistence over the flowchart entities.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ---- authoring -----------------------------------------------------
    /// Persist a flowchart; a zero id is assigned.
    async fn create_flowchart(&self, flowchart: Flowchart) -> Result<Flowchart>;
    async fn flowchart(&self, id: FlowchartId) -> Result<Flowchart>;

    // ---- runs ----------------------------------------------------------
    async fn create_run(
        &self,
        flowchart_id: FlowchartId,
        replay_of: Option<RunId>,
    ) -> Result<FlowchartRun>;
    async fn run(&self, id: RunId) -> Result<FlowchartRun>;
    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<FlowchartRun>;

    // ---- node runs & artifacts ----------------------------------------
    /// Reserve the next node-run id (the dispatch `execution_id`).
    async fn next_node_run_id(&self) -> Result<NodeRunId>;

    /// Persist one node run with its artifacts atomically.
    ///
    /// A duplicate artifact idempotency key rolls the whole write back with
    /// [`StoreError::Conflict`].
    async fn record_node_execution(
        &self,
        node_run: FlowchartRunNode,
        artifacts: Vec<NodeArtifact>,
    ) -> Result<(FlowchartRunNode, Vec<NodeArtifact>)>;

    async fn node_runs(&self, run_id: RunId) -> Result<Vec<FlowchartRunNode>>;
    async fn artifacts(&self, run_id: RunId) -> Result<Vec<NodeArtifact>>;

    // ---- replay --------------------------------------------------------
    /// Enqueue (or return the existing) replay run for `(run_id, key)`.
    async fn record_replay(&self, run_id: RunId, idempotency_key: &str) -> Result<ReplayOutcome>;

    // ---- scheduler -----------------------------------------------------
    async fn due_rag_sources(&self, now: chrono::DateTime<Utc>) -> Result<Vec<RagSource>>;
    async fn save_rag_source(&self, source: RagSource) -> Result<RagSource>;
}

// Run and node-run ids feed idempotency keys, which live in a process-wide
// registry; the sequences are process-unique so two store instances can never
// mint colliding keys.
static RUN_ID_SEQ: AtomicI64 = AtomicI64::new(0);
static NODE_RUN_ID_SEQ: AtomicI64 = AtomicI64::new(0);

fn mint_run_id() -> RunId {
    RUN_ID_SEQ.fetch_add(1, Ordering::SeqCst) + 1
}

fn mint_node_run_id() -> NodeRunId {
    NODE_RUN_ID_SEQ.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Default)]
struct InMemoryState {
    flowcharts: FxHashMap<FlowchartId, Flowchart>,
    runs: FxHashMap<RunId, FlowchartRun>,
    node_runs: Vec<FlowchartRunNode>,
    artifacts: Vec<NodeArtifact>,
    artifact_keys: FxHashMap<String, i64>,
    replays: FxHashMap<(RunId, String), RunId>,
    rag_sources: FxHashMap<i64, RagSource>,
    next_flowchart_id: FlowchartId,
    next_artifact_id: i64,
}

/// In-memory store; always available and the test default.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_flowchart(&self, mut flowchart: Flowchart) -> Result<Flowchart> {
        let mut state = self.state.lock();
        if flowchart.id == 0 {
            state.next_flowchart_id += 1;
            flowchart.id = state.next_flowchart_id;
        } else {
            state.next_flowchart_id = state.next_flowchart_id.max(flowchart.id);
        }
        for node in &mut flowchart.nodes {
            node.flowchart_id = flowchart.id;
        }
        state.flowcharts.insert(flowchart.id, flowchart.clone());
        Ok(flowchart)
    }

    async fn flowchart(&self, id: FlowchartId) -> Result<Flowchart> {
        self.state
            .lock()
            .flowcharts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "flowchart",
                id,
            })
    }

    async fn create_run(
        &self,
        flowchart_id: FlowchartId,
        replay_of: Option<RunId>,
    ) -> Result<FlowchartRun> {
        let mut state = self.state.lock();
        if !state.flowcharts.contains_key(&flowchart_id) {
            return Err(StoreError::NotFound {
                entity: "flowchart",
                id: flowchart_id,
            });
        }
        let run = FlowchartRun {
            id: mint_run_id(),
            flowchart_id,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            updated_at: Some(Utc::now()),
            replay_of,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn run(&self, id: RunId) -> Result<FlowchartRun> {
        self.state
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "run", id })
    }

    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<FlowchartRun> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "run", id })?;
        let now = Utc::now();
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
        }
        run.status = status;
        run.updated_at = Some(now);
        Ok(run.clone())
    }

    async fn next_node_run_id(&self) -> Result<NodeRunId> {
        Ok(mint_node_run_id())
    }

    async fn record_node_execution(
        &self,
        mut node_run: FlowchartRunNode,
        mut artifacts: Vec<NodeArtifact>,
    ) -> Result<(FlowchartRunNode, Vec<NodeArtifact>)> {
        let mut state = self.state.lock();
        // Conflict check first so a duplicate key leaves no partial write.
        for artifact in &artifacts {
            if state.artifact_keys.contains_key(&artifact.idempotency_key) {
                return Err(StoreError::Conflict {
                    entity: "artifact",
                    key: artifact.idempotency_key.clone(),
                });
            }
        }
        if node_run.id == 0 {
            node_run.id = mint_node_run_id();
        }
        if node_run.created_at.is_none() {
            node_run.created_at = Some(Utc::now());
        }
        for artifact in &mut artifacts {
            state.next_artifact_id += 1;
            artifact.id = state.next_artifact_id;
            artifact.flowchart_run_node_id = node_run.id;
            state
                .artifact_keys
                .insert(artifact.idempotency_key.clone(), artifact.id);
        }
        debug!(
            target: "llmctl_engine::store",
            node_run_id = node_run.id,
            artifact_count = artifacts.len(),
            "node execution recorded"
        );
        state.node_runs.push(node_run.clone());
        state.artifacts.extend(artifacts.iter().cloned());
        Ok((node_run, artifacts))
    }

    async fn node_runs(&self, run_id: RunId) -> Result<Vec<FlowchartRunNode>> {
        Ok(self
            .state
            .lock()
            .node_runs
            .iter()
            .filter(|node_run| node_run.flowchart_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn artifacts(&self, run_id: RunId) -> Result<Vec<NodeArtifact>> {
        Ok(self
            .state
            .lock()
            .artifacts
            .iter()
            .filter(|artifact| artifact.flowchart_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn record_replay(&self, run_id: RunId, idempotency_key: &str) -> Result<ReplayOutcome> {
        let mut state = self.state.lock();
        let source = state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: run_id,
            })?;
        let key = (run_id, idempotency_key.to_string());
        if let Some(existing_id) = state.replays.get(&key).copied() {
            let replay_run =
                state
                    .runs
                    .get(&existing_id)
                    .cloned()
                    .ok_or(StoreError::NotFound {
                        entity: "run",
                        id: existing_id,
                    })?;
            return Ok(ReplayOutcome {
                replay_run,
                existing: true,
            });
        }
        let replay_run = FlowchartRun {
            id: mint_run_id(),
            flowchart_id: source.flowchart_id,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            updated_at: Some(Utc::now()),
            replay_of: Some(run_id),
        };
        state.runs.insert(replay_run.id, replay_run.clone());
        state.replays.insert(key, replay_run.id);
        Ok(ReplayOutcome {
            replay_run,
            existing: false,
        })
    }

    async fn due_rag_sources(&self, now: chrono::DateTime<Utc>) -> Result<Vec<RagSource>> {
        Ok(self
            .state
            .lock()
            .rag_sources
            .values()
            .filter(|source| {
                source
                    .next_index_at
                    .map(|due_at| due_at <= now)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn save_rag_source(&self, source: RagSource) -> Result<RagSource> {
        self.state.lock().rag_sources.insert(source.id, source.clone());
        Ok(source)
    }
}
