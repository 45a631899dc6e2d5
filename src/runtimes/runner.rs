//! Flowchart run loop: topological advancement, edge routing, and control.
//!
//! The runner owns the realtime bus and drives one run at a time per call;
//! independent runs execute concurrently on the caller's worker pool, while
//! nodes within a run execute sequentially in graph order. Every node goes
//! through the execution router, so dispatch metadata is uniform across node
//! types; sub-flowchart nodes recurse into an isolated child run instead.
//!
//! Control operations are idempotent by design and always return an outcome
//! envelope, even when nothing changed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::contracts::{
    ContractError, DispatchStatus, RunMetadata, node_artifact_idempotency_key,
    node_run_idempotency_key, resolve_node_degraded_markers, validate_artifact_payload,
};
use crate::execution::{
    CancellationFlag, ExecutionError, ExecutionRequest, ExecutionResult, ExecutionRouter,
    ExecutionStatus, execution_callback,
};
use crate::idempotency::register_dispatch_key;
use crate::instructions::{
    DEFAULT_INSTRUCTIONS_SUBDIR, InstructionCompileInput, InstructionError,
    compile_instruction_package, materialize_instruction_package, validate_materialized_paths,
};
use crate::model::{
    Agent, Flowchart, FlowchartNode, FlowchartRun, FlowchartRunNode, GraphError, NodeArtifact,
    Role, Skill, validate_graph,
};
use crate::nodes::{
    NodeError, NodeHandlerRegistry, NodeHandlerRequest, build_artifact_payload,
};
use crate::realtime::{EventSpec, RealtimeBus, flowchart_scope_rooms};
use crate::skills::{
    SkillAdapterResult, SkillError, materialize_skill_set, resolve_skill_set, skill_ids_payload,
    skill_versions_payload,
};
use crate::types::{AgentId, NodeId, NodeType, RunId, RunStatus, SkillId};
use crate::utils::id_generator::flowchart_run_ids;

use super::settings::RuntimeSettings;
use super::store::{RunStore, StoreError};

/// Authoring entities the task handler context is resolved from.
#[derive(Default)]
pub struct AuthoringCatalog {
    pub agents: FxHashMap<AgentId, Agent>,
    pub roles: FxHashMap<i64, Role>,
    pub skills: FxHashMap<SkillId, Skill>,
}

impl AuthoringCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn skills_for(&self, bindings: &[crate::model::SkillBinding]) -> Vec<Skill> {
        bindings
            .iter()
            .filter_map(|binding| self.skills.get(&binding.skill_id).cloned())
            .collect()
    }
}

/// Errors surfaced by the run loop and control surface.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Instruction(#[from] InstructionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Skill(#[from] SkillError),

    #[error("flowchart node {node_id} not found in flowchart")]
    #[diagnostic(code(llmctl_engine::runner::node_missing))]
    NodeMissing { node_id: NodeId },

    #[error("retry control requires an idempotency key")]
    #[diagnostic(
        code(llmctl_engine::runner::retry_key),
        help("Pass idempotency_key so repeated retries return the same replay run.")
    )]
    MissingIdempotencyKey,

    #[error("sub-flowchart node {node_id} is missing ref_id")]
    #[diagnostic(code(llmctl_engine::runner::subflow_ref))]
    SubflowRef { node_id: NodeId },
}

/// Control surface actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl ControlAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pause" => Some(ControlAction::Pause),
            "resume" => Some(ControlAction::Resume),
            "cancel" => Some(ControlAction::Cancel),
            "retry" => Some(ControlAction::Retry),
            _ => None,
        }
    }
}

/// Result envelope of one control call.
#[derive(Clone, Debug)]
pub struct ControlOutcome {
    pub applied_action: String,
    pub updated: bool,
    pub idempotent: bool,
    pub run: FlowchartRun,
    pub replay_run: Option<FlowchartRun>,
}

struct NodeOutputs {
    output_state: Value,
    routing_state: Value,
}

/// Runtime execution engine for flowchart runs.
pub struct FlowchartRunner {
    store: Arc<dyn RunStore>,
    registry: Arc<NodeHandlerRegistry>,
    router: Arc<ExecutionRouter>,
    bus: Arc<RealtimeBus>,
    settings: RuntimeSettings,
    catalog: Arc<AuthoringCatalog>,
    workspaces_dir: PathBuf,
    runtime_homes_dir: PathBuf,
    codex_home: Option<PathBuf>,
    cancellations: Mutex<FxHashMap<RunId, CancellationFlag>>,
}

impl FlowchartRunner {
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<NodeHandlerRegistry>,
        router: Arc<ExecutionRouter>,
        bus: Arc<RealtimeBus>,
        settings: RuntimeSettings,
        catalog: Arc<AuthoringCatalog>,
        workspaces_dir: PathBuf,
        runtime_homes_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            bus,
            settings,
            catalog,
            workspaces_dir,
            runtime_homes_dir,
            codex_home: None,
            cancellations: Mutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn with_codex_home(mut self, codex_home: PathBuf) -> Self {
        self.codex_home = Some(codex_home);
        self
    }

    #[must_use]
    pub fn bus(&self) -> Arc<RealtimeBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    fn cancellation_for(&self, run_id: RunId) -> CancellationFlag {
        self.cancellations
            .lock()
            .entry(run_id)
            .or_insert_with(CancellationFlag::new)
            .clone()
    }

    // ------------------------------------------------------------------
    // Submission & control
    // ------------------------------------------------------------------

    /// Validate the graph and enqueue a run.
    pub async fn submit_run(&self, flowchart_id: i64) -> Result<FlowchartRun, RunnerError> {
        let flowchart = self.store.flowchart(flowchart_id).await?;
        validate_graph(&flowchart, self.settings.embedding_capable())?;
        let run = self.store.create_run(flowchart_id, None).await?;
        self.emit_run_event("flowchart.run.updated", &run, json!({"transition": "queued"}));
        Ok(run)
    }

    /// Apply a control action. Idempotent: repeated calls return a result
    /// envelope with `idempotent = true` and no effective change.
    pub async fn control(
        &self,
        run_id: RunId,
        action: ControlAction,
        idempotency_key: Option<&str>,
    ) -> Result<ControlOutcome, RunnerError> {
        let run = self.store.run(run_id).await?;
        match action {
            ControlAction::Pause => {
                let (target, updated) = match run.status {
                    RunStatus::Queued => (Some(RunStatus::Paused), true),
                    RunStatus::Running => (Some(RunStatus::Pausing), true),
                    RunStatus::Pausing | RunStatus::Paused => (None, false),
                    _ => (None, false),
                };
                let run = match target {
                    Some(status) => {
                        let run = self.store.set_run_status(run_id, status).await?;
                        self.emit_run_event(
                            "flowchart.run.updated",
                            &run,
                            json!({"transition": "pause"}),
                        );
                        run
                    }
                    None => run,
                };
                Ok(ControlOutcome {
                    applied_action: "pause".into(),
                    updated,
                    idempotent: !updated,
                    run,
                    replay_run: None,
                })
            }
            ControlAction::Resume => {
                let updated = matches!(run.status, RunStatus::Paused | RunStatus::Pausing);
                let run = if updated {
                    let run = self.store.set_run_status(run_id, RunStatus::Running).await?;
                    self.emit_run_event(
                        "flowchart.run.updated",
                        &run,
                        json!({"transition": "resume"}),
                    );
                    run
                } else {
                    run
                };
                Ok(ControlOutcome {
                    applied_action: "resume".into(),
                    updated,
                    idempotent: !updated,
                    run,
                    replay_run: None,
                })
            }
            ControlAction::Cancel => {
                let updated = !run.status.is_terminal();
                let run = if updated {
                    self.cancellation_for(run_id).cancel();
                    let run = self.store.set_run_status(run_id, RunStatus::Cancelled).await?;
                    self.emit_run_event(
                        "flowchart.run.updated",
                        &run,
                        json!({"transition": "cancelled"}),
                    );
                    run
                } else {
                    run
                };
                Ok(ControlOutcome {
                    applied_action: "cancel".into(),
                    updated,
                    idempotent: !updated,
                    run,
                    replay_run: None,
                })
            }
            ControlAction::Retry => {
                let key = idempotency_key
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .ok_or(RunnerError::MissingIdempotencyKey)?;
                let outcome = self.store.record_replay(run_id, key).await?;
                if !outcome.existing {
                    self.emit_run_event(
                        "flowchart.run.updated",
                        &outcome.replay_run,
                        json!({"transition": "replay_queued", "replay_of": run_id}),
                    );
                }
                Ok(ControlOutcome {
                    applied_action: if outcome.existing {
                        "replay_existing".into()
                    } else {
                        "replay_queued".into()
                    },
                    updated: !outcome.existing,
                    idempotent: outcome.existing,
                    run,
                    replay_run: Some(outcome.replay_run),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Execute a run to a settled state (terminal or paused).
    #[instrument(skip(self))]
    pub async fn execute_run(&self, run_id: RunId) -> Result<RunStatus, RunnerError> {
        match self.drive_run(run_id).await {
            Ok(status) => Ok(status),
            Err(err) => {
                warn!(
                    target: "llmctl_engine::runner",
                    run_id,
                    error = %err,
                    "run failed with engine error"
                );
                if let Ok(run) = self.store.set_run_status(run_id, RunStatus::Failed).await {
                    self.emit_run_event(
                        "flowchart.run.updated",
                        &run,
                        json!({"transition": "failed", "error": err.to_string()}),
                    );
                }
                Err(err)
            }
        }
    }

    fn execute_run_boxed(&self, run_id: RunId) -> BoxFuture<'_, Result<RunStatus, RunnerError>> {
        Box::pin(self.execute_run(run_id))
    }

    async fn drive_run(&self, run_id: RunId) -> Result<RunStatus, RunnerError> {
        let run = self.store.run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        // A paused run stays paused until an explicit resume.
        match run.status {
            RunStatus::Paused => return Ok(RunStatus::Paused),
            RunStatus::Pausing => {
                let run = self.store.set_run_status(run_id, RunStatus::Paused).await?;
                self.emit_run_event(
                    "flowchart.run.updated",
                    &run,
                    json!({"transition": "paused"}),
                );
                return Ok(RunStatus::Paused);
            }
            _ => {}
        }
        let flowchart = self.store.flowchart(run.flowchart_id).await?;
        validate_graph(&flowchart, self.settings.embedding_capable())?;
        let cancellation = self.cancellation_for(run_id);

        let run = self.store.set_run_status(run_id, RunStatus::Running).await?;
        self.emit_run_event("flowchart.run.updated", &run, json!({"transition": "started"}));

        let start = flowchart
            .start_node()
            .ok_or(GraphError::StartCount { count: 0 })?;
        let mut frontier: VecDeque<NodeId> = VecDeque::from([start.id]);
        let mut counters: FxHashMap<NodeId, u32> = FxHashMap::default();
        let mut outputs: FxHashMap<NodeId, NodeOutputs> = FxHashMap::default();

        while let Some(node_id) = frontier.pop_front() {
            // Control checkpoint at the handler boundary.
            let current = self.store.run(run_id).await?;
            match current.status {
                RunStatus::Pausing => {
                    let run = self.store.set_run_status(run_id, RunStatus::Paused).await?;
                    self.emit_run_event(
                        "flowchart.run.updated",
                        &run,
                        json!({"transition": "paused"}),
                    );
                    return Ok(RunStatus::Paused);
                }
                RunStatus::Paused => return Ok(RunStatus::Paused),
                RunStatus::Cancelled => return Ok(RunStatus::Cancelled),
                _ => {}
            }
            if cancellation.is_cancelled() {
                let run = self.store.set_run_status(run_id, RunStatus::Cancelled).await?;
                self.emit_run_event(
                    "flowchart.run.updated",
                    &run,
                    json!({"transition": "cancelled"}),
                );
                return Ok(RunStatus::Cancelled);
            }

            let node = flowchart
                .node(node_id)
                .ok_or(RunnerError::NodeMissing { node_id })?
                .clone();
            let execution_index = {
                let counter = counters.entry(node_id).or_insert(0);
                *counter += 1;
                *counter
            };
            let node_run_key = node_run_idempotency_key(run_id, node_id, execution_index);
            if !register_dispatch_key(&node_run_key) {
                // Already executed (resume or crash-retry). Reuse the
                // persisted outputs so routing continues without a second
                // dispatch.
                let prior = self
                    .store
                    .node_runs(run_id)
                    .await?
                    .into_iter()
                    .find(|node_run| {
                        node_run.flowchart_node_id == node_id
                            && node_run.execution_index == execution_index
                    });
                if let Some(prior) = prior {
                    let routing_state = prior.routing_state.clone();
                    let terminate = routing_state
                        .get("terminate_run")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    outputs.insert(
                        node_id,
                        NodeOutputs {
                            output_state: prior.output_state,
                            routing_state: routing_state.clone(),
                        },
                    );
                    if terminate {
                        break;
                    }
                    for target in route_targets(&flowchart, node_id, &routing_state) {
                        frontier.push_back(target);
                    }
                } else {
                    warn!(
                        target: "llmctl_engine::runner",
                        run_id,
                        node_id,
                        execution_index,
                        "node execution already registered with no persisted record; skipping"
                    );
                }
                continue;
            }

            let (request_id, correlation_id) = flowchart_run_ids(run_id);
            let input_context = build_input_context(
                &flowchart,
                &node,
                &outputs,
                run_id,
                execution_index,
                &request_id,
                &correlation_id,
            );

            let dispatch = self
                .dispatch_node(
                    run_id,
                    &node,
                    execution_index,
                    input_context.clone(),
                    &request_id,
                    &correlation_id,
                    &cancellation,
                )
                .await?;

            let succeeded = dispatch.result.is_success();
            let output_state = dispatch.result.output_state.clone();
            let routing_state = dispatch.result.routing_state.clone();

            let node_run = self
                .persist_node_execution(
                    run_id,
                    &flowchart,
                    &node,
                    execution_index,
                    &input_context,
                    &dispatch,
                    &request_id,
                    &correlation_id,
                )
                .await?;

            self.emit_node_events(&flowchart, &run, &node, &node_run, &dispatch.result);

            if !succeeded {
                let run = self.store.set_run_status(run_id, RunStatus::Failed).await?;
                self.emit_run_event(
                    "flowchart.run.updated",
                    &run,
                    json!({"transition": "failed", "node_id": node.id}),
                );
                return Ok(RunStatus::Failed);
            }

            let terminate = routing_state
                .get("terminate_run")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            outputs.insert(
                node_id,
                NodeOutputs {
                    output_state,
                    routing_state: routing_state.clone(),
                },
            );
            if terminate {
                break;
            }

            for target in route_targets(&flowchart, node_id, &routing_state) {
                frontier.push_back(target);
            }
        }

        let run = self.store.set_run_status(run_id, RunStatus::Succeeded).await?;
        self.emit_run_event(
            "flowchart.run.updated",
            &run,
            json!({"transition": "succeeded"}),
        );
        Ok(RunStatus::Succeeded)
    }

    // ------------------------------------------------------------------
    // Node dispatch
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_node(
        &self,
        run_id: RunId,
        node: &FlowchartNode,
        execution_index: u32,
        mut input_context: Value,
        request_id: &str,
        correlation_id: &str,
        cancellation: &CancellationFlag,
    ) -> Result<NodeDispatch, RunnerError> {
        if node.node_type == NodeType::Flowchart {
            return self.dispatch_subflow(run_id, node, &input_context).await;
        }

        let execution_id = self.store.next_node_run_id().await?;
        let mut resolved = ResolvedTaskContext::default();
        if node.node_type == NodeType::Task {
            resolved = self
                .resolve_task_context(run_id, node, &mut input_context)
                .await?;
        }

        let mut request =
            ExecutionRequest::new(node.id, node.node_type, execution_id, execution_index)
                .with_config(node.config.clone())
                .with_input_context(input_context.clone());
        request.node_ref_id = node.ref_id;
        request.default_model_id = node.model_id;
        request.timeouts = self.settings.timeouts();
        request.cancellation = cancellation.clone();

        let handler = self.registry.require(node.node_type)?;
        let handler_request = NodeHandlerRequest {
            node: node.clone(),
            input_context,
            execution_id,
            execution_index,
            request_id: request_id.to_string(),
            correlation_id: correlation_id.to_string(),
        };
        let callback = execution_callback(move |_provider_request: ExecutionRequest| {
            let handler = Arc::clone(&handler);
            let handler_request = handler_request.clone();
            async move {
                let output = handler
                    .handle(handler_request)
                    .await
                    .map_err(|err| ExecutionError::callback(err.to_string()))?;
                Ok((output.output_state, output.routing_state))
            }
        });

        let result = self.router.execute(request, callback).await;
        Ok(NodeDispatch {
            execution_id,
            result,
            resolved,
        })
    }

    /// Recursive sub-flowchart invocation. The child run owns its node runs
    /// and artifacts; the parent records only the summary output.
    async fn dispatch_subflow(
        &self,
        run_id: RunId,
        node: &FlowchartNode,
        input_context: &Value,
    ) -> Result<NodeDispatch, RunnerError> {
        let sub_flowchart_id = node.ref_id.ok_or(RunnerError::SubflowRef { node_id: node.id })?;
        let execution_id = self.store.next_node_run_id().await?;
        let sub_run = self.store.create_run(sub_flowchart_id, None).await?;
        info!(
            target: "llmctl_engine::runner",
            parent_run = run_id,
            sub_run = sub_run.id,
            "starting sub-flowchart run"
        );
        let status = self.execute_run_boxed(sub_run.id).await?;

        let run_metadata = RunMetadata {
            selected_provider: Some(self.router.selected_provider().as_str().to_string()),
            final_provider: Some(self.router.selected_provider().as_str().to_string()),
            provider_dispatch_id: Some(format!("flowchart:{}", sub_run.id)),
            workspace_identity: Some(
                self.settings.router_settings().workspace_identity_key.clone(),
            ),
            dispatch_status: Some(DispatchStatus::DispatchConfirmed),
            fallback_attempted: false,
            fallback_reason: None,
            dispatch_uncertain: false,
            api_failure_category: None,
            cli_fallback_used: false,
            cli_preflight_passed: None,
        };
        let output_state = json!({
            "node_type": "flowchart",
            "sub_flowchart_id": sub_flowchart_id,
            "sub_run_id": sub_run.id,
            "sub_run_status": status.encode(),
            "input_context": input_context,
            "output_state": {},
        });
        let result = ExecutionResult {
            contract_version: crate::contracts::CONTRACT_VERSION.to_string(),
            status: if status == RunStatus::Succeeded {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            exit_code: Some(0),
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            stdout: String::new(),
            stderr: String::new(),
            error: if status == RunStatus::Succeeded {
                None
            } else {
                Some(json!({"code": "subflow_failed", "message": format!("sub-run ended {status}")}))
            },
            provider_metadata: json!({"provider": "flowchart", "sub_run_id": sub_run.id}),
            output_state,
            routing_state: json!({}),
            run_metadata,
        };
        Ok(NodeDispatch {
            execution_id,
            result,
            resolved: ResolvedTaskContext::default(),
        })
    }

    /// Resolve agent/role, compile and materialize instructions, and
    /// materialize skills for a task node. Facts land on the input context
    /// under `runtime` for the prompt envelope.
    async fn resolve_task_context(
        &self,
        run_id: RunId,
        node: &FlowchartNode,
        input_context: &mut Value,
    ) -> Result<ResolvedTaskContext, RunnerError> {
        let agent_id = node
            .config
            .get("agent_id")
            .and_then(Value::as_i64)
            .or(node.ref_id);
        let agent = agent_id.and_then(|id| self.catalog.agents.get(&id));
        let role = agent
            .and_then(|agent| agent.role_id)
            .and_then(|id| self.catalog.roles.get(&id));

        let provider = self.router.selected_provider().as_str().to_string();
        let workspace = self.workspaces_dir.join(format!("run-{run_id}"));
        let runtime_home = self.runtime_homes_dir.join(format!("run-{run_id}"));

        let mut compile_input = InstructionCompileInput::new("flowchart", provider.as_str())
            .with_role_markdown(role.map(|role| role.markdown.clone()).unwrap_or_default())
            .with_agent_markdown(agent.map(|agent| agent.markdown.clone()).unwrap_or_default())
            .with_source_id("agent_id", agent.map(|agent| agent.id))
            .with_source_id("role_id", role.map(|role| role.id));
        if let Some(prompt) = node.config_str("runtime_override") {
            compile_input = compile_input.with_runtime_overrides(vec![prompt]);
        }
        let package = compile_instruction_package(&compile_input);
        let materialized =
            materialize_instruction_package(&package, &workspace, DEFAULT_INSTRUCTIONS_SUBDIR)?;
        validate_materialized_paths(
            &materialized.paths,
            &workspace,
            &runtime_home,
            self.codex_home.as_deref(),
        )?;

        // Agent-bound skills first, node-bound skills appended after.
        let mut bindings = agent
            .map(|agent| agent.skill_bindings.clone())
            .unwrap_or_default();
        bindings.extend(node.skill_bindings.iter().copied());
        let skills = self.catalog.skills_for(&bindings);
        let resolved_set = resolve_skill_set(&skills, &bindings)?;
        let adapter_result = materialize_skill_set(
            &resolved_set,
            &provider,
            &workspace,
            &runtime_home,
            self.codex_home.as_deref(),
            self.settings.allow_skill_adapter_fallback(),
        )?;

        if let Some(context) = input_context.as_object_mut() {
            context.insert(
                "runtime".to_string(),
                json!({
                    "agent_markdown": package.artifacts.get("AGENT.md"),
                    "role_markdown": package.artifacts.get("ROLE.md"),
                    "instruction_manifest_hash": package.manifest_hash.clone(),
                    "skill_manifest_hash": resolved_set.manifest_hash.clone(),
                    "skill_fallback_entries": adapter_result.fallback_entries.clone(),
                    "skill_ids": skill_ids_payload(&resolved_set),
                    "skill_versions": skill_versions_payload(&resolved_set),
                }),
            );
        }

        Ok(ResolvedTaskContext {
            agent_id: agent.map(|agent| agent.id),
            role_id: role.map(|role| role.id),
            instruction_manifest_hash: Some(package.manifest_hash.clone()),
            instruction_materialized_paths: materialized.paths,
            adapter: Some(adapter_result),
        })
    }

    // ------------------------------------------------------------------
    // Persistence & events
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn persist_node_execution(
        &self,
        run_id: RunId,
        flowchart: &Flowchart,
        node: &FlowchartNode,
        execution_index: u32,
        input_context: &Value,
        dispatch: &NodeDispatch,
        request_id: &str,
        correlation_id: &str,
    ) -> Result<FlowchartRunNode, RunnerError> {
        let result = &dispatch.result;
        let metadata = &result.run_metadata;
        let degraded_payload = degraded_marker_payload(metadata, &result.output_state, &result.routing_state);
        let (degraded_status, degraded_reason) = resolve_node_degraded_markers(&degraded_payload);

        let node_run = FlowchartRunNode {
            id: dispatch.execution_id,
            flowchart_run_id: run_id,
            flowchart_node_id: node.id,
            execution_index,
            status: if result.is_success() {
                "succeeded".to_string()
            } else {
                "failed".to_string()
            },
            input_context: input_context.clone(),
            output_state: result.output_state.clone(),
            routing_state: result.routing_state.clone(),
            degraded_status,
            degraded_reason,
            resolved_agent_id: dispatch.resolved.agent_id,
            resolved_role_id: dispatch.resolved.role_id,
            resolved_instruction_manifest_hash: dispatch
                .resolved
                .instruction_manifest_hash
                .clone(),
            instruction_materialized_paths: dispatch
                .resolved
                .instruction_materialized_paths
                .clone(),
            selected_provider: metadata.selected_provider.clone(),
            final_provider: metadata.final_provider.clone(),
            provider_dispatch_id: metadata.provider_dispatch_id.clone(),
            workspace_identity: metadata.workspace_identity.clone(),
            dispatch_status: metadata.dispatch_status.map(|status| status.encode().to_string()),
            fallback_attempted: metadata.fallback_attempted,
            fallback_reason: metadata.fallback_reason.clone(),
            dispatch_uncertain: metadata.dispatch_uncertain,
            api_failure_category: metadata.api_failure_category.clone(),
            cli_fallback_used: metadata.cli_fallback_used,
            cli_preflight_passed: metadata.cli_preflight_passed,
            created_at: None,
        };

        let artifacts = if result.is_success() {
            let artifact_type = node.node_type.into();
            let payload = build_artifact_payload(
                node.node_type,
                input_context,
                &result.output_state,
                &result.routing_state,
            );
            validate_artifact_payload(artifact_type, &payload)?;
            vec![NodeArtifact {
                id: 0,
                flowchart_id: flowchart.id,
                flowchart_node_id: node.id,
                flowchart_run_id: run_id,
                flowchart_run_node_id: node_run.id,
                node_type: node.node_type,
                artifact_type,
                payload,
                request_id: Some(request_id.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                variant_key: None,
                idempotency_key: node_artifact_idempotency_key(run_id, node_run.id, artifact_type),
                created_at: Utc::now(),
            }]
        } else {
            Vec::new()
        };

        let (node_run, _artifacts) = self.store.record_node_execution(node_run, artifacts).await?;
        Ok(node_run)
    }

    fn emit_node_events(
        &self,
        flowchart: &Flowchart,
        run: &FlowchartRun,
        node: &FlowchartNode,
        node_run: &FlowchartRunNode,
        result: &ExecutionResult,
    ) {
        let rooms = flowchart_scope_rooms(Some(flowchart.id), Some(run.id), Some(node.id));
        let event_type = format!(
            "node.{}.{}",
            node.node_type.encode(),
            if result.is_success() { "completed" } else { "failed" }
        );
        let (request_id, correlation_id) = flowchart_run_ids(run.id);
        let spec = EventSpec::new(event_type, "flowchart_node", node.id.to_string())
            .with_rooms(rooms.clone())
            .with_payload(json!({
                "node_run_id": node_run.id,
                "execution_index": node_run.execution_index,
                "status": node_run.status.clone(),
                "request_id": request_id,
                "correlation_id": correlation_id,
            }))
            .with_runtime(result.run_metadata.clone());
        if let Err(err) = self.bus.emit_contract_event(spec) {
            warn!(target: "llmctl_engine::runner", error = %err, "node event emission failed");
        }

        if node_run.degraded_status {
            let spec = EventSpec::new("flowchart.run.warning", "flowchart_run", run.id.to_string())
                .with_rooms(rooms)
                .with_payload(json!({
                    "event_type": "flowchart_warning",
                    "node_id": node.id,
                    "node_run_id": node_run.id,
                    "message": node_run.degraded_reason.clone(),
                    "correlation_id": format!("flowchart-run-{}", run.id),
                }))
                .with_runtime(result.run_metadata.clone());
            if let Err(err) = self.bus.emit_contract_event(spec) {
                warn!(target: "llmctl_engine::runner", error = %err, "warning event emission failed");
            }
        }
    }

    fn emit_run_event(&self, event_type: &str, run: &FlowchartRun, extra: Value) {
        let (request_id, correlation_id) = flowchart_run_ids(run.id);
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!(run.status.encode()));
        payload.insert("request_id".to_string(), json!(request_id));
        payload.insert("correlation_id".to_string(), json!(correlation_id));
        if let Some(extra) = extra.as_object() {
            for (key, value) in extra {
                payload.insert(key.clone(), value.clone());
            }
        }
        let spec = EventSpec::new(event_type, "flowchart_run", run.id.to_string())
            .with_rooms(flowchart_scope_rooms(Some(run.flowchart_id), Some(run.id), None))
            .with_payload(Value::Object(payload));
        if let Err(err) = self.bus.emit_contract_event(spec) {
            warn!(target: "llmctl_engine::runner", error = %err, "run event emission failed");
        }
    }
}

struct NodeDispatch {
    execution_id: i64,
    result: ExecutionResult,
    resolved: ResolvedTaskContext,
}

#[derive(Default)]
struct ResolvedTaskContext {
    agent_id: Option<i64>,
    role_id: Option<i64>,
    instruction_manifest_hash: Option<String>,
    instruction_materialized_paths: Vec<String>,
    #[allow(dead_code)]
    adapter: Option<SkillAdapterResult>,
}

/// Merge run metadata with the deterministic-tooling markers for degraded
/// resolution.
fn degraded_marker_payload(
    metadata: &RunMetadata,
    output_state: &Value,
    routing_state: &Value,
) -> Value {
    let mut payload = match metadata.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(status) = output_state.get("execution_status").and_then(Value::as_str) {
        payload.insert("deterministic_execution_status".to_string(), json!(status));
    }
    let deterministic_fallback = output_state
        .get("fallback_used")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if deterministic_fallback {
        payload.insert("deterministic_fallback_used".to_string(), json!(true));
    }
    if payload
        .get("fallback_reason")
        .map(|value| value.is_null())
        .unwrap_or(true)
    {
        if let Some(reason) = output_state
            .get("fallback_reason")
            .or_else(|| routing_state.get("fallback_reason"))
            .and_then(Value::as_str)
        {
            payload.insert("fallback_reason".to_string(), json!(reason));
        }
    }
    Value::Object(payload)
}

/// Compute input context for one node execution: the latest solid upstream
/// output, dotted upstream context, and the aggregate upstream node list.
#[allow(clippy::too_many_arguments)]
fn build_input_context(
    flowchart: &Flowchart,
    node: &FlowchartNode,
    outputs: &FxHashMap<NodeId, NodeOutputs>,
    run_id: RunId,
    execution_index: u32,
    request_id: &str,
    correlation_id: &str,
) -> Value {
    let mut latest_upstream = Value::Null;
    let mut dotted_context = Map::new();
    let mut upstream_nodes = Vec::new();
    for edge in flowchart.incoming(node.id) {
        let Some(upstream) = outputs.get(&edge.source_node_id) else {
            continue;
        };
        upstream_nodes.push(json!({
            "node_id": edge.source_node_id,
            "edge_mode": edge.edge_mode.encode(),
        }));
        match edge.edge_mode {
            crate::types::EdgeMode::Solid => {
                latest_upstream = json!({
                    "node_id": edge.source_node_id,
                    "output_state": upstream.output_state.clone(),
                    "routing_state": upstream.routing_state.clone(),
                });
            }
            crate::types::EdgeMode::Dotted => {
                dotted_context.insert(
                    edge.source_node_id.to_string(),
                    json!({"output_state": upstream.output_state.clone()}),
                );
            }
        }
    }
    json!({
        "flowchart_run_id": run_id,
        "node": {
            "id": node.id,
            "node_type": node.node_type.encode(),
            "execution_index": execution_index,
        },
        "latest_upstream": latest_upstream,
        "dotted_context": dotted_context,
        "upstream_nodes": upstream_nodes,
        "request_id": request_id,
        "correlation_id": correlation_id,
    })
}

/// Edge routing for one completed node.
///
/// Priority: `route_key` matches edges by `condition_key`; else
/// `matched_connector_ids` matches edges by id; else every solid outgoing
/// edge advances. Only solid edges ever enter the frontier.
fn route_targets(flowchart: &Flowchart, node_id: NodeId, routing_state: &Value) -> Vec<NodeId> {
    let solid_outgoing: Vec<_> = flowchart
        .outgoing(node_id)
        .into_iter()
        .filter(|edge| edge.edge_mode == crate::types::EdgeMode::Solid)
        .collect();

    if let Some(route_key) = routing_state
        .get("route_key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return solid_outgoing
            .iter()
            .filter(|edge| edge.condition_key.as_deref() == Some(route_key))
            .map(|edge| edge.target_node_id)
            .collect();
    }

    if let Some(matched) = routing_state
        .get("matched_connector_ids")
        .and_then(Value::as_array)
    {
        let matched: Vec<&str> = matched.iter().filter_map(Value::as_str).collect();
        return solid_outgoing
            .iter()
            .filter(|edge| matched.contains(&edge.id.as_str()))
            .map(|edge| edge.target_node_id)
            .collect();
    }

    solid_outgoing
        .iter()
        .map(|edge| edge.target_node_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowchartEdge;
    use crate::types::EdgeMode;

    fn flowchart_with_edges(edges: Vec<FlowchartEdge>) -> Flowchart {
        let nodes = vec![
            FlowchartNode {
                id: 1,
                flowchart_id: 1,
                node_type: NodeType::Decision,
                title: "d".into(),
                config: json!({}),
                ref_id: None,
                model_id: None,
                position: None,
                skill_bindings: Vec::new(),
            },
            FlowchartNode {
                id: 2,
                flowchart_id: 1,
                node_type: NodeType::End,
                title: "a".into(),
                config: json!({}),
                ref_id: None,
                model_id: None,
                position: None,
                skill_bindings: Vec::new(),
            },
            FlowchartNode {
                id: 3,
                flowchart_id: 1,
                node_type: NodeType::End,
                title: "b".into(),
                config: json!({}),
                ref_id: None,
                model_id: None,
                position: None,
                skill_bindings: Vec::new(),
            },
        ];
        Flowchart {
            id: 1,
            name: "routing".into(),
            nodes,
            edges,
        }
    }

    fn edge(id: &str, to: NodeId, condition_key: Option<&str>, mode: EdgeMode) -> FlowchartEdge {
        FlowchartEdge {
            id: id.into(),
            source_node_id: 1,
            target_node_id: to,
            edge_mode: mode,
            condition_key: condition_key.map(str::to_string),
        }
    }

    #[test]
    fn route_key_matches_condition_keys() {
        let flowchart = flowchart_with_edges(vec![
            edge("e1", 2, Some("a"), EdgeMode::Solid),
            edge("e2", 3, Some("b"), EdgeMode::Solid),
        ]);
        let targets = route_targets(&flowchart, 1, &json!({"route_key": "b"}));
        assert_eq!(targets, vec![3]);
    }

    #[test]
    fn matched_connector_ids_match_edge_ids() {
        let flowchart = flowchart_with_edges(vec![
            edge("e1", 2, None, EdgeMode::Solid),
            edge("e2", 3, None, EdgeMode::Solid),
        ]);
        let targets = route_targets(&flowchart, 1, &json!({"matched_connector_ids": ["e1"]}));
        assert_eq!(targets, vec![2]);
    }

    #[test]
    fn default_routing_follows_all_solid_edges_only() {
        let flowchart = flowchart_with_edges(vec![
            edge("e1", 2, None, EdgeMode::Solid),
            edge("e2", 3, None, EdgeMode::Dotted),
        ]);
        let targets = route_targets(&flowchart, 1, &json!({}));
        assert_eq!(targets, vec![2]);
    }

    #[test]
    fn no_match_with_no_fallback_edge_terminates_branch() {
        let flowchart = flowchart_with_edges(vec![
            edge("e1", 2, None, EdgeMode::Solid),
            edge("e2", 3, None, EdgeMode::Solid),
        ]);
        let targets = route_targets(
            &flowchart,
            1,
            &json!({"matched_connector_ids": [], "no_match": true}),
        );
        assert!(targets.is_empty());
    }
}
