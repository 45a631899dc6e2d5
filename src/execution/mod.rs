//! Execution providers and the provider router.
//!
//! A node's work is dispatched through exactly one [`ExecutionProvider`]:
//! the in-process [`WorkspaceExecutor`](workspace::WorkspaceExecutor) or the
//! Job-per-node [`KubernetesExecutor`](kubernetes::KubernetesExecutor). The
//! [`ExecutionRouter`](router::ExecutionRouter) selects the provider from
//! runtime settings and stamps workspace identity on every dispatch.
//!
//! Providers never raise for dispatch failures: every outcome is an
//! [`ExecutionResult`] whose `run_metadata` carries the on-wire dispatch
//! facts. Errors escape only for programming mistakes (e.g. a poisoned
//! callback seam).

pub mod kubernetes;
pub mod router;
pub mod workspace;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::contracts::{DispatchStatus, RunMetadata};
use crate::types::{NodeId, NodeType};

pub use kubernetes::{KubernetesExecutor, KubernetesSettings};
pub use router::{ExecutionRouter, ProviderKind, RouterSettings};
pub use workspace::WorkspaceExecutor;

/// Cooperative cancellation flag shared between the run loop and providers.
///
/// Workspace executions are aborted at the next check of this flag; the
/// boundary is "before the next provider dispatch or store write"; an
/// in-flight callback body is never interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-node dispatch and execution deadlines, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTimeouts {
    pub dispatch_timeout_seconds: u64,
    pub execution_timeout_seconds: u64,
    pub log_collection_timeout_seconds: u64,
    pub cancel_grace_timeout_seconds: u64,
}

impl Default for ExecutionTimeouts {
    fn default() -> Self {
        Self {
            dispatch_timeout_seconds: 120,
            execution_timeout_seconds: 1800,
            log_collection_timeout_seconds: 30,
            cancel_grace_timeout_seconds: 15,
        }
    }
}

/// Request handed to a provider for one node execution.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub node_ref_id: Option<i64>,
    pub node_config: Value,
    pub input_context: Value,
    /// Node-run identifier; unique per execution.
    pub execution_id: i64,
    pub execution_index: u32,
    pub default_model_id: Option<i64>,
    pub mcp_server_keys: Vec<String>,
    pub timeouts: ExecutionTimeouts,
    pub cancellation: CancellationFlag,
    // Routing stamps, populated by the router before dispatch.
    pub selected_provider: Option<String>,
    pub final_provider: Option<String>,
    pub workspace_identity: Option<String>,
    pub dispatch_status: Option<DispatchStatus>,
    /// Latch preventing double-fallback on the legacy integration path.
    pub fallback_attempted: bool,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(node_id: NodeId, node_type: NodeType, execution_id: i64, execution_index: u32) -> Self {
        Self {
            node_id,
            node_type,
            node_ref_id: None,
            node_config: Value::Object(serde_json::Map::new()),
            input_context: Value::Object(serde_json::Map::new()),
            execution_id,
            execution_index,
            default_model_id: None,
            mcp_server_keys: Vec::new(),
            timeouts: ExecutionTimeouts::default(),
            cancellation: CancellationFlag::new(),
            selected_provider: None,
            final_provider: None,
            workspace_identity: None,
            dispatch_status: None,
            fallback_attempted: false,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.node_config = config;
        self
    }

    #[must_use]
    pub fn with_input_context(mut self, input_context: Value) -> Self {
        self.input_context = input_context;
        self
    }
}

/// Terminal status of one provider execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Result of one provider execution, success or failure alike.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub contract_version: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    /// `{code, message}` object on failure paths.
    pub error: Option<Value>,
    pub provider_metadata: Value,
    pub output_state: Value,
    pub routing_state: Value,
    pub run_metadata: RunMetadata,
}

impl ExecutionResult {
    /// Failure result carrying only metadata and an error object.
    #[must_use]
    pub fn failed(run_metadata: RunMetadata, code: &str, message: impl Into<String>) -> Self {
        Self {
            contract_version: crate::contracts::CONTRACT_VERSION.to_string(),
            status: ExecutionStatus::Failed,
            exit_code: None,
            started_at: None,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(serde_json::json!({"code": code, "message": message.into()})),
            provider_metadata: Value::Object(serde_json::Map::new()),
            output_state: Value::Object(serde_json::Map::new()),
            routing_state: Value::Object(serde_json::Map::new()),
            run_metadata,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Failure raised by an execution callback.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutionError {
    #[error("execution callback failed: {message}")]
    #[diagnostic(code(llmctl_engine::execution::callback))]
    Callback {
        message: String,
        /// Optional API failure classifier surfaced in run metadata.
        api_failure_category: Option<String>,
    },

    #[error("execution cancelled")]
    #[diagnostic(code(llmctl_engine::execution::cancelled))]
    Cancelled,

    #[error("provider subprocess failed: {0}")]
    #[diagnostic(code(llmctl_engine::execution::subprocess))]
    Subprocess(String),

    #[error(transparent)]
    #[diagnostic(code(llmctl_engine::execution::serde))]
    Serde(#[from] serde_json::Error),
}

impl ExecutionError {
    #[must_use]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
            api_failure_category: None,
        }
    }

    #[must_use]
    pub fn callback_with_category(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
            api_failure_category: Some(category.into()),
        }
    }
}

/// In-process work executed by the workspace provider.
///
/// Takes the request by value and resolves to `(output_state, routing_state)`.
pub type ExecutionCallback = Arc<
    dyn Fn(ExecutionRequest) -> BoxFuture<'static, Result<(Value, Value), ExecutionError>>
        + Send
        + Sync,
>;

/// Wrap an async closure into an [`ExecutionCallback`].
pub fn execution_callback<F, Fut>(f: F) -> ExecutionCallback
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Value, Value), ExecutionError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Capability implemented by both provider variants.
///
/// Providers report failures through the result's `run_metadata`; the `Err`
/// channel is reserved for infrastructure faults that the run loop treats as
/// node failure.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Stable provider name (`workspace` or `kubernetes`).
    fn provider_name(&self) -> &'static str;

    /// Dispatch one node execution.
    async fn execute(&self, request: ExecutionRequest, callback: ExecutionCallback)
    -> ExecutionResult;

    /// Cancel an in-flight dispatch identified by `provider_dispatch_id`.
    async fn cancel(&self, provider_dispatch_id: &str) -> Result<(), ExecutionError> {
        let _ = provider_dispatch_id;
        Ok(())
    }
}
