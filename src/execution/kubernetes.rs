//! Kubernetes Job-per-node executor.
//!
//! Each dispatch materializes one Job whose container receives a JSON payload
//! on stdin and reports through two stdout markers:
//!
//! 1. `LLMCTL_EXECUTOR_STARTED` before any other stdout, then
//! 2. `LLMCTL_EXECUTOR_RESULT_JSON=<json>` on a single line at completion.
//!
//! A submission is *ambiguous* until both markers are observed; ambiguous
//! dispatches surface `dispatch_failed` with `dispatch_uncertain = true` and
//! never auto-fallback. The node callback is never invoked by this provider:
//! the Job itself performs the work.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{
    ExecutionCallback, ExecutionError, ExecutionProvider, ExecutionRequest, ExecutionResult,
    ExecutionStatus,
};
use crate::contracts::{DispatchStatus, RunMetadata, dispatch_idempotency_key};
use crate::idempotency::register_dispatch_key;

pub const KUBERNETES_PROVIDER: &str = "kubernetes";

/// Stdout marker the executor container must print before anything else.
pub const EXECUTOR_STARTED_MARKER: &str = "LLMCTL_EXECUTOR_STARTED";
/// Stdout prefix carrying the single-line JSON result.
pub const EXECUTOR_RESULT_PREFIX: &str = "LLMCTL_EXECUTOR_RESULT_JSON=";

/// Label attached to every executor Job, used by the pruner's selector.
const EXECUTOR_JOB_LABEL: &str = "llmctl.ai/executor";

/// Kubernetes provider configuration.
#[derive(Clone, Debug)]
pub struct KubernetesSettings {
    pub namespace: String,
    pub image: String,
    pub in_cluster: bool,
    pub service_account: String,
    pub gpu_limit: u32,
    pub job_ttl_seconds: u64,
    pub image_pull_secrets: Vec<String>,
    pub kubeconfig: Option<String>,
    pub cancel_force_kill: bool,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "llmctl-executor:latest".to_string(),
            in_cluster: false,
            service_account: String::new(),
            gpu_limit: 0,
            job_ttl_seconds: 1800,
            image_pull_secrets: Vec::new(),
            kubeconfig: None,
            cancel_force_kill: false,
        }
    }
}

/// Captured output of one kubectl invocation.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Seam over the kubectl subprocess so tests can observe issued commands.
#[async_trait]
pub trait KubectlRunner: Send + Sync {
    async fn run(&self, args: &[String], stdin: Option<String>)
    -> Result<CommandOutput, ExecutionError>;
}

/// Default runner driving the real `kubectl` binary via `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct SystemKubectl;

#[async_trait]
impl KubectlRunner for SystemKubectl {
    async fn run(
        &self,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut command = Command::new("kubectl");
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|err| ExecutionError::Subprocess(format!("spawn kubectl: {err}")))?;
        if let (Some(payload), Some(mut handle)) = (stdin, child.stdin.take()) {
            handle
                .write_all(payload.as_bytes())
                .await
                .map_err(|err| ExecutionError::Subprocess(format!("write kubectl stdin: {err}")))?;
            drop(handle);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ExecutionError::Subprocess(format!("wait kubectl: {err}")))?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Dispatch failure internal to the provider.
///
/// `fallback_reason` is a hint for the router's legacy workspace fallback; it
/// is surfaced through `provider_metadata`, never through run metadata.
#[derive(Clone, Debug)]
struct KubernetesDispatchFailure {
    fallback_reason: String,
    message: String,
    uncertain: bool,
}

/// Job-per-node Kubernetes executor.
pub struct KubernetesExecutor {
    settings: KubernetesSettings,
    kubectl: Arc<dyn KubectlRunner>,
    poll_interval: Duration,
}

impl KubernetesExecutor {
    #[must_use]
    pub fn new(settings: KubernetesSettings) -> Self {
        Self::with_runner(settings, Arc::new(SystemKubectl))
    }

    /// Construct with an injected kubectl seam. Poll interval shrinks under
    /// test runners that want tight loops.
    #[must_use]
    pub fn with_runner(settings: KubernetesSettings, kubectl: Arc<dyn KubectlRunner>) -> Self {
        Self {
            settings,
            kubectl,
            poll_interval: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Job name derived from the run-node identity; RFC 1123 safe.
    #[must_use]
    pub fn job_name(request: &ExecutionRequest) -> String {
        let raw = format!(
            "llmctl-exec-{}-{}-{}",
            request.execution_id, request.node_id, request.execution_index
        );
        let mut name: String = raw
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' {
                    ch.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        name.truncate(63);
        name.trim_matches('-').to_string()
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), self.settings.namespace.clone()];
        if let Some(ref kubeconfig) = self.settings.kubeconfig {
            if !kubeconfig.trim().is_empty() {
                args.push("--kubeconfig".to_string());
                args.push(kubeconfig.clone());
            }
        }
        args
    }

    fn base_metadata(&self, request: &ExecutionRequest) -> RunMetadata {
        RunMetadata {
            selected_provider: Some(
                request
                    .selected_provider
                    .clone()
                    .unwrap_or_else(|| KUBERNETES_PROVIDER.to_string()),
            ),
            final_provider: Some(KUBERNETES_PROVIDER.to_string()),
            provider_dispatch_id: None,
            workspace_identity: request.workspace_identity.clone(),
            dispatch_status: Some(DispatchStatus::DispatchPending),
            fallback_attempted: request.fallback_attempted,
            fallback_reason: None,
            dispatch_uncertain: false,
            api_failure_category: None,
            cli_fallback_used: false,
            cli_preflight_passed: None,
        }
    }

    /// Build the Job manifest for one execution.
    ///
    /// GPU limits are attached only when `gpu_limit > 0`; `imagePullSecrets`
    /// only when configured. The payload travels on the container's stdin via
    /// the manifest annotation consumed by the executor entrypoint.
    #[must_use]
    pub fn build_job_manifest(
        &self,
        request: &ExecutionRequest,
        job_name: &str,
        payload_json: &str,
    ) -> Value {
        let mut limits = serde_json::Map::new();
        if self.settings.gpu_limit > 0 {
            limits.insert(
                "nvidia.com/gpu".to_string(),
                json!(self.settings.gpu_limit.to_string()),
            );
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": "executor",
                "image": self.settings.image.clone(),
                "stdin": true,
                "stdinOnce": true,
                "resources": {"limits": Value::Object(limits)},
                "env": [
                    {"name": "LLMCTL_EXECUTION_ID", "value": request.execution_id.to_string()},
                    {"name": "LLMCTL_NODE_TYPE", "value": request.node_type.encode()},
                ],
            }],
        });
        if !self.settings.service_account.trim().is_empty() {
            pod_spec["serviceAccountName"] = json!(self.settings.service_account.clone());
        }
        if !self.settings.image_pull_secrets.is_empty() {
            pod_spec["imagePullSecrets"] = json!(
                self.settings
                    .image_pull_secrets
                    .iter()
                    .map(|name| json!({"name": name}))
                    .collect::<Vec<_>>()
            );
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "namespace": self.settings.namespace.clone(),
                "labels": {
                    EXECUTOR_JOB_LABEL: "true",
                    "llmctl.ai/workspace-identity": request.workspace_identity.clone().unwrap_or_default(),
                    "llmctl.ai/execution-id": request.execution_id.to_string(),
                    "llmctl.ai/node-id": request.node_id.to_string(),
                },
                "annotations": {
                    "llmctl.ai/payload": payload_json,
                },
            },
            "spec": {
                "ttlSecondsAfterFinished": self.settings.job_ttl_seconds,
                "backoffLimit": 0,
                "activeDeadlineSeconds": request.timeouts.execution_timeout_seconds,
                "template": {"spec": pod_spec},
            },
        })
    }

    async fn submit_job(
        &self,
        manifest: &Value,
    ) -> Result<(), KubernetesDispatchFailure> {
        let mut args = self.base_args();
        args.extend(["create".to_string(), "-f".to_string(), "-".to_string()]);
        let output = self
            .kubectl
            .run(&args, Some(manifest.to_string()))
            .await
            .map_err(|err| KubernetesDispatchFailure {
                fallback_reason: "provider_unavailable".to_string(),
                message: err.to_string(),
                uncertain: false,
            })?;
        if !output.ok() {
            return Err(KubernetesDispatchFailure {
                fallback_reason: "provider_unavailable".to_string(),
                message: format!("kubectl create failed: {}", output.stderr.trim()),
                uncertain: false,
            });
        }
        Ok(())
    }

    async fn job_phase(&self, job_name: &str) -> Result<JobPhase, KubernetesDispatchFailure> {
        let mut args = self.base_args();
        args.extend([
            "get".to_string(),
            "job".to_string(),
            job_name.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ]);
        let output = self
            .kubectl
            .run(&args, None)
            .await
            .map_err(|err| KubernetesDispatchFailure {
                fallback_reason: "provider_unavailable".to_string(),
                message: err.to_string(),
                uncertain: true,
            })?;
        if !output.ok() {
            return Ok(JobPhase::Unknown);
        }
        let parsed: Value = serde_json::from_str(&output.stdout).unwrap_or(Value::Null);
        let status = parsed.get("status").cloned().unwrap_or(Value::Null);
        let succeeded = status.get("succeeded").and_then(Value::as_u64).unwrap_or(0);
        let failed = status.get("failed").and_then(Value::as_u64).unwrap_or(0);
        if succeeded > 0 {
            Ok(JobPhase::Succeeded)
        } else if failed > 0 {
            Ok(JobPhase::Failed)
        } else {
            Ok(JobPhase::Active)
        }
    }

    async fn collect_logs(&self, job_name: &str) -> String {
        let mut args = self.base_args();
        args.extend([
            "logs".to_string(),
            format!("job/{job_name}"),
            "--tail=-1".to_string(),
        ]);
        match self.kubectl.run(&args, None).await {
            Ok(output) if output.ok() => output.stdout,
            Ok(output) => {
                warn!(
                    target: "llmctl_engine::execution",
                    job = job_name,
                    stderr = %output.stderr.trim(),
                    "log collection failed"
                );
                String::new()
            }
            Err(err) => {
                warn!(
                    target: "llmctl_engine::execution",
                    job = job_name,
                    error = %err,
                    "log collection errored"
                );
                String::new()
            }
        }
    }

    /// Parse the marker protocol out of collected pod logs.
    ///
    /// Returns `(result_json, stdout)` when both markers were observed in
    /// order; `None` marks the dispatch ambiguous.
    #[must_use]
    pub fn parse_executor_markers(logs: &str) -> Option<(Value, String)> {
        let mut lines = logs.lines();
        let first = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => continue,
                other => break other,
            }
        };
        if first?.trim() != EXECUTOR_STARTED_MARKER {
            return None;
        }
        for line in lines {
            if let Some(raw) = line.trim().strip_prefix(EXECUTOR_RESULT_PREFIX) {
                let parsed: Value = serde_json::from_str(raw).ok()?;
                return Some((parsed, logs.to_string()));
            }
        }
        None
    }

    /// Delete a Job, gracefully first and forcefully when configured.
    pub async fn cancel_job(
        &self,
        job_name: &str,
        cancel_grace_timeout: u64,
        cancel_force_kill: bool,
    ) -> Result<(), ExecutionError> {
        let mut graceful = self.base_args();
        graceful.extend([
            "delete".to_string(),
            "job".to_string(),
            job_name.to_string(),
            "--grace-period".to_string(),
            cancel_grace_timeout.to_string(),
        ]);
        self.kubectl.run(&graceful, None).await?;
        if cancel_force_kill {
            let mut forced = self.base_args();
            forced.extend([
                "delete".to_string(),
                "job".to_string(),
                job_name.to_string(),
                "--grace-period".to_string(),
                "0".to_string(),
                "--force".to_string(),
            ]);
            self.kubectl.run(&forced, None).await?;
        }
        Ok(())
    }

    /// Delete completed executor Jobs older than `job_ttl_seconds`.
    pub async fn prune_completed_jobs(&self, job_ttl_seconds: u64) -> Result<Vec<String>, ExecutionError> {
        let mut args = self.base_args();
        args.extend([
            "get".to_string(),
            "jobs".to_string(),
            "-l".to_string(),
            format!("{EXECUTOR_JOB_LABEL}=true"),
            "-o".to_string(),
            "json".to_string(),
        ]);
        let output = self.kubectl.run(&args, None).await?;
        if !output.ok() {
            return Err(ExecutionError::Subprocess(format!(
                "kubectl get jobs failed: {}",
                output.stderr.trim()
            )));
        }
        let parsed: Value = serde_json::from_str(&output.stdout)?;
        let cutoff = Utc::now() - chrono::Duration::seconds(job_ttl_seconds as i64);
        let mut deleted = Vec::new();
        for item in parsed.get("items").and_then(Value::as_array).into_iter().flatten() {
            let Some(name) = item
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };
            let Some(completion) = item
                .pointer("/status/completionTime")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            else {
                continue;
            };
            if completion.with_timezone(&Utc) < cutoff {
                let mut delete = self.base_args();
                delete.extend(["delete".to_string(), "job".to_string(), name.clone()]);
                self.kubectl.run(&delete, None).await?;
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    fn dispatch_failure_result(
        &self,
        request: &ExecutionRequest,
        failure: KubernetesDispatchFailure,
    ) -> ExecutionResult {
        let mut metadata = self.base_metadata(request);
        metadata.dispatch_status = Some(DispatchStatus::DispatchFailed);
        metadata.dispatch_uncertain = failure.uncertain;
        let mut result = ExecutionResult::failed(metadata, "dispatch_failed", failure.message);
        result.provider_metadata = json!({
            "provider": KUBERNETES_PROVIDER,
            "fallback_reason": failure.fallback_reason,
        });
        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobPhase {
    Active,
    Succeeded,
    Failed,
    Unknown,
}

#[async_trait]
impl ExecutionProvider for KubernetesExecutor {
    fn provider_name(&self) -> &'static str {
        KUBERNETES_PROVIDER
    }

    #[instrument(
        skip(self, request, _callback),
        fields(execution_id = request.execution_id, node_id = request.node_id)
    )]
    async fn execute(
        &self,
        request: ExecutionRequest,
        _callback: ExecutionCallback,
    ) -> ExecutionResult {
        let dispatch_key = dispatch_idempotency_key(KUBERNETES_PROVIDER, request.execution_id);
        if !register_dispatch_key(&dispatch_key) {
            let mut metadata = self.base_metadata(&request);
            metadata.dispatch_status = Some(DispatchStatus::DispatchFailed);
            return ExecutionResult::failed(
                metadata,
                "idempotency_conflict",
                format!("dispatch key already registered: {dispatch_key}"),
            );
        }

        if !self.settings.in_cluster
            && self
                .settings
                .kubeconfig
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return self.dispatch_failure_result(
                &request,
                KubernetesDispatchFailure {
                    fallback_reason: "provider_unavailable".to_string(),
                    message: "kubernetes provider requires kubeconfig when not in-cluster".to_string(),
                    uncertain: false,
                },
            );
        }

        let job_name = Self::job_name(&request);
        let payload = json!({
            "node_id": request.node_id,
            "node_type": request.node_type.encode(),
            "node_ref_id": request.node_ref_id,
            "node_config": request.node_config.clone(),
            "input_context": request.input_context.clone(),
            "execution_id": request.execution_id,
            "execution_index": request.execution_index,
            "default_model_id": request.default_model_id,
            "mcp_server_keys": request.mcp_server_keys.clone(),
        });
        let manifest = self.build_job_manifest(&request, &job_name, &payload.to_string());

        let started_at = Utc::now();
        if let Err(failure) = self.submit_job(&manifest).await {
            return self.dispatch_failure_result(&request, failure);
        }
        debug!(
            target: "llmctl_engine::execution",
            job = %job_name,
            "kubernetes job submitted"
        );

        let deadline =
            started_at + chrono::Duration::seconds(request.timeouts.execution_timeout_seconds as i64);
        let phase = loop {
            if request.cancellation.is_cancelled() {
                let _ = self
                    .cancel_job(
                        &job_name,
                        request.timeouts.cancel_grace_timeout_seconds,
                        self.settings.cancel_force_kill,
                    )
                    .await;
                return self.dispatch_failure_result(
                    &request,
                    KubernetesDispatchFailure {
                        fallback_reason: "cancelled".to_string(),
                        message: "execution cancelled".to_string(),
                        uncertain: false,
                    },
                );
            }
            match self.job_phase(&job_name).await {
                Ok(JobPhase::Active | JobPhase::Unknown) => {
                    if Utc::now() >= deadline {
                        let _ = self
                            .cancel_job(
                                &job_name,
                                request.timeouts.cancel_grace_timeout_seconds,
                                self.settings.cancel_force_kill,
                            )
                            .await;
                        return self.dispatch_failure_result(
                            &request,
                            KubernetesDispatchFailure {
                                fallback_reason: "execution_timeout".to_string(),
                                message: format!(
                                    "job {job_name} did not finish within {}s",
                                    request.timeouts.execution_timeout_seconds
                                ),
                                uncertain: true,
                            },
                        );
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(phase) => break phase,
                Err(failure) => return self.dispatch_failure_result(&request, failure),
            }
        };

        let logs = self.collect_logs(&job_name).await;
        let Some((result_json, stdout)) = Self::parse_executor_markers(&logs) else {
            // No started/result marker pair: the submission is ambiguous and
            // must not auto-fallback.
            return self.dispatch_failure_result(
                &request,
                KubernetesDispatchFailure {
                    fallback_reason: "dispatch_uncertain".to_string(),
                    message: format!("job {job_name} produced no executor markers"),
                    uncertain: true,
                },
            );
        };

        let mut metadata = self.base_metadata(&request);
        metadata.dispatch_status = Some(DispatchStatus::DispatchConfirmed);
        metadata.provider_dispatch_id = Some(format!(
            "kubernetes:{}/{}",
            self.settings.namespace, job_name
        ));

        let output_state = result_json.get("output_state").cloned().unwrap_or(Value::Null);
        let routing_state = result_json
            .get("routing_state")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let exit_code = result_json
            .get("exit_code")
            .and_then(Value::as_i64)
            .map(|code| code as i32);

        if phase == JobPhase::Failed {
            let mut result = ExecutionResult::failed(
                metadata,
                "execution_error",
                result_json
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("executor job failed")
                    .to_string(),
            );
            result.stdout = stdout;
            result.exit_code = exit_code;
            result.started_at = Some(started_at);
            result.finished_at = Some(Utc::now());
            return result;
        }

        ExecutionResult {
            contract_version: crate::contracts::CONTRACT_VERSION.to_string(),
            status: ExecutionStatus::Success,
            exit_code: exit_code.or(Some(0)),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            stdout,
            stderr: String::new(),
            error: None,
            provider_metadata: json!({
                "provider": KUBERNETES_PROVIDER,
                "job_name": job_name,
                "namespace": self.settings.namespace.clone(),
            }),
            output_state,
            routing_state,
            run_metadata: metadata,
        }
    }

    async fn cancel(&self, provider_dispatch_id: &str) -> Result<(), ExecutionError> {
        // Dispatch ids look like `kubernetes:<namespace>/<job-name>`.
        let job_name = provider_dispatch_id
            .strip_prefix("kubernetes:")
            .and_then(|rest| rest.rsplit('/').next())
            .unwrap_or(provider_dispatch_id);
        self.cancel_job(
            job_name,
            super::ExecutionTimeouts::default().cancel_grace_timeout_seconds,
            self.settings.cancel_force_kill,
        )
        .await
    }
}
