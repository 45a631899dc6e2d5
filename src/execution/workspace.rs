//! In-process workspace executor.
//!
//! The workspace provider runs the node callback on the worker thread after
//! recording its dispatch key. Duplicate dispatch keys fail without side
//! effects; cancellation is cooperative via the request's
//! [`CancellationFlag`](super::CancellationFlag).

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{
    ExecutionCallback, ExecutionError, ExecutionProvider, ExecutionRequest, ExecutionResult,
    ExecutionStatus,
};
use crate::contracts::{DispatchStatus, RunMetadata, dispatch_idempotency_key};
use crate::idempotency::register_dispatch_key;

pub const WORKSPACE_PROVIDER: &str = "workspace";

/// Executes node callbacks in-process.
#[derive(Clone, Debug, Default)]
pub struct WorkspaceExecutor;

impl WorkspaceExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn base_metadata(request: &ExecutionRequest) -> RunMetadata {
        RunMetadata {
            selected_provider: Some(
                request
                    .selected_provider
                    .clone()
                    .unwrap_or_else(|| WORKSPACE_PROVIDER.to_string()),
            ),
            final_provider: Some(WORKSPACE_PROVIDER.to_string()),
            provider_dispatch_id: Some(format!(
                "workspace:workspace-{}",
                request.execution_id
            )),
            workspace_identity: request.workspace_identity.clone(),
            dispatch_status: Some(DispatchStatus::DispatchConfirmed),
            fallback_attempted: request.fallback_attempted,
            fallback_reason: None,
            dispatch_uncertain: false,
            api_failure_category: None,
            cli_fallback_used: false,
            cli_preflight_passed: None,
        }
    }
}

#[async_trait]
impl ExecutionProvider for WorkspaceExecutor {
    fn provider_name(&self) -> &'static str {
        WORKSPACE_PROVIDER
    }

    #[instrument(
        skip(self, request, callback),
        fields(execution_id = request.execution_id, node_id = request.node_id)
    )]
    async fn execute(
        &self,
        request: ExecutionRequest,
        callback: ExecutionCallback,
    ) -> ExecutionResult {
        let dispatch_key = dispatch_idempotency_key(WORKSPACE_PROVIDER, request.execution_id);
        if !register_dispatch_key(&dispatch_key) {
            warn!(
                target: "llmctl_engine::execution",
                key = %dispatch_key,
                "duplicate workspace dispatch key"
            );
            let mut metadata = Self::base_metadata(&request);
            metadata.dispatch_status = Some(DispatchStatus::DispatchFailed);
            metadata.provider_dispatch_id = None;
            return ExecutionResult::failed(
                metadata,
                "idempotency_conflict",
                format!("dispatch key already registered: {dispatch_key}"),
            );
        }

        if request.cancellation.is_cancelled() {
            let mut metadata = Self::base_metadata(&request);
            metadata.dispatch_status = Some(DispatchStatus::DispatchFailed);
            return ExecutionResult::failed(metadata, "cancelled", "execution cancelled before dispatch");
        }

        let started_at = Utc::now();
        let metadata = Self::base_metadata(&request);
        debug!(
            target: "llmctl_engine::execution",
            execution_id = request.execution_id,
            "workspace dispatch confirmed"
        );

        match callback(request).await {
            Ok((output_state, routing_state)) => ExecutionResult {
                contract_version: crate::contracts::CONTRACT_VERSION.to_string(),
                status: ExecutionStatus::Success,
                exit_code: Some(0),
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
                stdout: String::new(),
                stderr: String::new(),
                error: None,
                provider_metadata: json!({"provider": WORKSPACE_PROVIDER}),
                output_state,
                routing_state,
                run_metadata: metadata,
            },
            Err(err) => {
                let mut metadata = metadata;
                if let ExecutionError::Callback {
                    api_failure_category: Some(ref category),
                    ..
                } = err
                {
                    metadata.api_failure_category = Some(category.clone());
                }
                let code = if matches!(err, ExecutionError::Cancelled) {
                    "cancelled"
                } else {
                    "execution_error"
                };
                let mut result = ExecutionResult::failed(metadata, code, err.to_string());
                result.started_at = Some(started_at);
                result.finished_at = Some(Utc::now());
                result
            }
        }
    }
}
