//! Execution router: provider selection and workspace-identity stamping.
//!
//! The router reads runtime settings, coerces unknown provider selections to
//! `kubernetes`, and stamps every request with `selected_provider`,
//! `workspace_identity`, and `dispatch_status = dispatch_pending` before
//! delegating to the chosen provider.
//!
//! A legacy integration path supports falling back to the workspace provider
//! when a Kubernetes dispatch fails outright: only when explicitly enabled,
//! never for ambiguous dispatches, and at most once per request (the
//! `fallback_attempted` latch). Newer code paths leave the flag off and defer
//! to operator replay.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{
    ExecutionCallback, ExecutionProvider, ExecutionRequest, ExecutionResult, ExecutionStatus,
};
use crate::contracts::DispatchStatus;

/// Provider selection after coercion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Workspace,
    Kubernetes,
}

impl ProviderKind {
    /// Coerce a raw setting value. Anything outside
    /// `{workspace, kubernetes}` becomes `Kubernetes`.
    #[must_use]
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "workspace" => ProviderKind::Workspace,
            _ => ProviderKind::Kubernetes,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Workspace => "workspace",
            ProviderKind::Kubernetes => "kubernetes",
        }
    }
}

/// Router-facing slice of the runtime settings.
#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub provider: String,
    pub workspace_identity_key: String,
    /// Legacy integration flag gating the kubernetes→workspace fallback.
    pub workspace_fallback_enabled: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            provider: "kubernetes".to_string(),
            workspace_identity_key: "default".to_string(),
            workspace_fallback_enabled: false,
        }
    }
}

/// Routes execution requests to the configured provider.
pub struct ExecutionRouter {
    settings: RouterSettings,
    workspace: Arc<dyn ExecutionProvider>,
    kubernetes: Arc<dyn ExecutionProvider>,
}

impl ExecutionRouter {
    #[must_use]
    pub fn new(
        settings: RouterSettings,
        workspace: Arc<dyn ExecutionProvider>,
        kubernetes: Arc<dyn ExecutionProvider>,
    ) -> Self {
        Self {
            settings,
            workspace,
            kubernetes,
        }
    }

    /// The provider the router will dispatch to, after coercion.
    #[must_use]
    pub fn selected_provider(&self) -> ProviderKind {
        ProviderKind::coerce(&self.settings.provider)
    }

    /// Stamp routing metadata onto a request.
    ///
    /// Both `selected_provider` and `final_provider` are set to the coerced
    /// value; dispatch status starts at `dispatch_pending`.
    #[must_use]
    pub fn route_request(&self, mut request: ExecutionRequest) -> ExecutionRequest {
        let provider = self.selected_provider();
        if !self.settings.provider.trim().eq_ignore_ascii_case(provider.as_str()) {
            warn!(
                target: "llmctl_engine::execution",
                configured = %self.settings.provider,
                coerced = provider.as_str(),
                "unknown provider selection coerced"
            );
        }
        request.selected_provider = Some(provider.as_str().to_string());
        request.final_provider = Some(provider.as_str().to_string());
        request.workspace_identity = Some(self.settings.workspace_identity_key.clone());
        request.dispatch_status = Some(DispatchStatus::DispatchPending);
        request
    }

    /// Execute a routed request on the chosen provider.
    #[instrument(skip(self, request, callback), fields(execution_id = request.execution_id))]
    pub async fn execute_routed(
        &self,
        request: ExecutionRequest,
        callback: ExecutionCallback,
    ) -> ExecutionResult {
        match self.selected_provider() {
            ProviderKind::Workspace => self.workspace.execute(request, callback).await,
            ProviderKind::Kubernetes => {
                let fallback_eligible =
                    self.settings.workspace_fallback_enabled && !request.fallback_attempted;
                let fallback_request = request.clone();
                let result = self.kubernetes.execute(request, callback.clone()).await;
                if result.status == ExecutionStatus::Success
                    || !fallback_eligible
                    || result.run_metadata.dispatch_uncertain
                    || result.run_metadata.dispatch_status != Some(DispatchStatus::DispatchFailed)
                {
                    return result;
                }
                self.fallback_to_workspace(fallback_request, callback, &result)
                    .await
            }
        }
    }

    /// Route and execute in one step.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        callback: ExecutionCallback,
    ) -> ExecutionResult {
        let routed = self.route_request(request);
        self.execute_routed(routed, callback).await
    }

    async fn fallback_to_workspace(
        &self,
        mut request: ExecutionRequest,
        callback: ExecutionCallback,
        failed: &ExecutionResult,
    ) -> ExecutionResult {
        let reason = failed
            .provider_metadata
            .get("fallback_reason")
            .and_then(Value::as_str)
            .unwrap_or("dispatch_failed")
            .to_string();
        info!(
            target: "llmctl_engine::execution",
            execution_id = request.execution_id,
            reason = %reason,
            "kubernetes dispatch failed; attempting workspace fallback"
        );
        request.fallback_attempted = true;
        request.dispatch_status = Some(DispatchStatus::DispatchFallbackStarted);
        let mut result = self.workspace.execute(request, callback).await;
        result.run_metadata.selected_provider = Some(ProviderKind::Kubernetes.as_str().to_string());
        result.run_metadata.fallback_attempted = true;
        result.run_metadata.fallback_reason = Some(reason);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_coerces_to_kubernetes() {
        assert_eq!(ProviderKind::coerce("docker"), ProviderKind::Kubernetes);
        assert_eq!(ProviderKind::coerce(""), ProviderKind::Kubernetes);
        assert_eq!(ProviderKind::coerce("Workspace"), ProviderKind::Workspace);
        assert_eq!(ProviderKind::coerce(" kubernetes "), ProviderKind::Kubernetes);
    }
}
