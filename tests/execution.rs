use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use llmctl_engine::contracts::DispatchStatus;
use llmctl_engine::execution::kubernetes::{
    CommandOutput, EXECUTOR_RESULT_PREFIX, EXECUTOR_STARTED_MARKER, KubectlRunner,
};
use llmctl_engine::execution::{
    ExecutionError, ExecutionProvider, ExecutionRequest, ExecutionRouter, ExecutionStatus,
    KubernetesExecutor, KubernetesSettings, ProviderKind, RouterSettings, WorkspaceExecutor,
    execution_callback,
};
use llmctl_engine::types::NodeType;

fn request(execution_id: i64) -> ExecutionRequest {
    let mut request = ExecutionRequest::new(12, NodeType::Start, execution_id, 1);
    request.workspace_identity = Some("default".to_string());
    request
}

fn noop_callback(flag: Arc<AtomicBool>) -> llmctl_engine::execution::ExecutionCallback {
    execution_callback(move |_request| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok((json!({"node_type": "start", "message": "ok"}), json!({})))
        }
    })
}

// ---------------------------------------------------------------------------
// Workspace executor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workspace_executor_confirms_dispatch_and_runs_callback() {
    let executor = WorkspaceExecutor::new();
    let invoked = Arc::new(AtomicBool::new(false));
    let result = executor
        .execute(request(9001), noop_callback(Arc::clone(&invoked)))
        .await;

    assert!(invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Success);
    let metadata = &result.run_metadata;
    assert_eq!(metadata.selected_provider.as_deref(), Some("workspace"));
    assert_eq!(metadata.final_provider.as_deref(), Some("workspace"));
    assert_eq!(
        metadata.dispatch_status,
        Some(DispatchStatus::DispatchConfirmed)
    );
    assert_eq!(
        metadata.provider_dispatch_id.as_deref(),
        Some("workspace:workspace-9001")
    );
    assert!(!metadata.fallback_attempted);
    assert_eq!(metadata.workspace_identity.as_deref(), Some("default"));

    // The 11-key on-wire schema: nulls present, never omitted.
    let wire = metadata.to_value();
    assert_eq!(wire.as_object().unwrap().len(), 11);
    assert!(wire["fallback_reason"].is_null());
    assert!(wire["cli_preflight_passed"].is_null());
}

#[tokio::test]
async fn workspace_executor_rejects_duplicate_dispatch_keys() {
    let executor = WorkspaceExecutor::new();
    let first_invoked = Arc::new(AtomicBool::new(false));
    let result = executor
        .execute(request(9002), noop_callback(Arc::clone(&first_invoked)))
        .await;
    assert_eq!(result.status, ExecutionStatus::Success);

    let second_invoked = Arc::new(AtomicBool::new(false));
    let result = executor
        .execute(request(9002), noop_callback(Arc::clone(&second_invoked)))
        .await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(!second_invoked.load(Ordering::SeqCst));
    assert_eq!(
        result.run_metadata.dispatch_status,
        Some(DispatchStatus::DispatchFailed)
    );
    assert_eq!(result.error.unwrap()["code"], "idempotency_conflict");
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn router_with(provider: &str) -> ExecutionRouter {
    let workspace: Arc<dyn ExecutionProvider> = Arc::new(WorkspaceExecutor::new());
    ExecutionRouter::new(
        RouterSettings {
            provider: provider.to_string(),
            workspace_identity_key: "workspace-main".to_string(),
            workspace_fallback_enabled: false,
        },
        workspace.clone(),
        workspace,
    )
}

#[test]
fn router_coerces_unknown_providers_to_kubernetes() {
    let router = router_with("docker");
    assert_eq!(router.selected_provider(), ProviderKind::Kubernetes);
    let routed = router.route_request(request(9003));
    assert_eq!(routed.selected_provider.as_deref(), Some("kubernetes"));
    assert_eq!(routed.final_provider.as_deref(), Some("kubernetes"));
    assert_eq!(routed.dispatch_status, Some(DispatchStatus::DispatchPending));
    assert_eq!(routed.workspace_identity.as_deref(), Some("workspace-main"));
}

#[tokio::test]
async fn router_stamps_identity_and_executes_workspace() {
    let router = router_with("workspace");
    let invoked = Arc::new(AtomicBool::new(false));
    let result = router
        .execute(request(9004), noop_callback(Arc::clone(&invoked)))
        .await;
    assert!(invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        result.run_metadata.workspace_identity.as_deref(),
        Some("workspace-main")
    );
}

// ---------------------------------------------------------------------------
// Kubernetes executor
// ---------------------------------------------------------------------------

/// Scripted kubectl runner: responds by verb, records every invocation.
#[derive(Default)]
struct FakeKubectl {
    commands: Mutex<Vec<Vec<String>>>,
    job_status: Mutex<Value>,
    logs: Mutex<String>,
    create_fails: bool,
}

impl FakeKubectl {
    fn verb(args: &[String]) -> &str {
        args.iter()
            .map(String::as_str)
            .find(|arg| matches!(*arg, "create" | "get" | "logs" | "delete"))
            .unwrap_or("")
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl KubectlRunner for FakeKubectl {
    async fn run(
        &self,
        args: &[String],
        _stdin: Option<String>,
    ) -> Result<CommandOutput, ExecutionError> {
        self.commands.lock().push(args.to_vec());
        let verb = Self::verb(args);
        let output = match verb {
            "create" if self.create_fails => CommandOutput {
                code: 1,
                stdout: String::new(),
                stderr: "connection refused".to_string(),
            },
            "get" => CommandOutput {
                code: 0,
                stdout: self.job_status.lock().to_string(),
                stderr: String::new(),
            },
            "logs" => CommandOutput {
                code: 0,
                stdout: self.logs.lock().clone(),
                stderr: String::new(),
            },
            _ => CommandOutput::default(),
        };
        Ok(output)
    }
}

fn in_cluster_settings() -> KubernetesSettings {
    KubernetesSettings {
        in_cluster: true,
        ..KubernetesSettings::default()
    }
}

#[tokio::test]
async fn kubernetes_requires_kubeconfig_when_not_in_cluster() {
    let kubectl = Arc::new(FakeKubectl::default());
    let executor = KubernetesExecutor::with_runner(KubernetesSettings::default(), kubectl.clone());
    let invoked = Arc::new(AtomicBool::new(false));

    let result = executor
        .execute(request(9010), noop_callback(Arc::clone(&invoked)))
        .await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.run_metadata.dispatch_status,
        Some(DispatchStatus::DispatchFailed)
    );
    assert!(
        result.error.unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("requires kubeconfig")
    );
    assert!(kubectl.commands().is_empty());
}

#[tokio::test]
async fn kubernetes_dispatch_failure_reports_failed_without_fallback() {
    let kubectl = Arc::new(FakeKubectl {
        create_fails: true,
        ..FakeKubectl::default()
    });
    let executor = KubernetesExecutor::with_runner(in_cluster_settings(), kubectl);
    let invoked = Arc::new(AtomicBool::new(false));

    let result = executor
        .execute(request(9011), noop_callback(Arc::clone(&invoked)))
        .await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Failed);
    let metadata = &result.run_metadata;
    assert_eq!(metadata.selected_provider.as_deref(), Some("kubernetes"));
    assert_eq!(metadata.final_provider.as_deref(), Some("kubernetes"));
    assert_eq!(metadata.dispatch_status, Some(DispatchStatus::DispatchFailed));
    assert!(!metadata.fallback_attempted);
    assert!(metadata.fallback_reason.is_none());
    assert_eq!(result.provider_metadata["fallback_reason"], "provider_unavailable");
}

#[tokio::test]
async fn ambiguous_pod_output_is_dispatch_failed_and_uncertain() {
    let kubectl = Arc::new(FakeKubectl::default());
    *kubectl.job_status.lock() = json!({"status": {"succeeded": 1}});
    *kubectl.logs.lock() = "some unrelated output\nwithout any markers\n".to_string();
    let executor =
        KubernetesExecutor::with_runner(in_cluster_settings(), kubectl).with_poll_interval(
            Duration::from_millis(1),
        );
    let invoked = Arc::new(AtomicBool::new(false));

    let result = executor
        .execute(request(9012), noop_callback(Arc::clone(&invoked)))
        .await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.run_metadata.dispatch_status,
        Some(DispatchStatus::DispatchFailed)
    );
    assert!(result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
}

#[tokio::test]
async fn marker_protocol_produces_confirmed_success() {
    let kubectl = Arc::new(FakeKubectl::default());
    *kubectl.job_status.lock() = json!({"status": {"succeeded": 1}});
    *kubectl.logs.lock() = format!(
        "{EXECUTOR_STARTED_MARKER}\nprogress line\n{EXECUTOR_RESULT_PREFIX}{}\n",
        json!({"output_state": {"node_type": "task", "answer": 42}, "routing_state": {}, "exit_code": 0})
    );
    let executor =
        KubernetesExecutor::with_runner(in_cluster_settings(), kubectl).with_poll_interval(
            Duration::from_millis(1),
        );
    let invoked = Arc::new(AtomicBool::new(false));

    let result = executor
        .execute(request(9013), noop_callback(Arc::clone(&invoked)))
        .await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.output_state["answer"], 42);
    assert_eq!(
        result.run_metadata.dispatch_status,
        Some(DispatchStatus::DispatchConfirmed)
    );
    let dispatch_id = result.run_metadata.provider_dispatch_id.unwrap();
    assert!(dispatch_id.starts_with("kubernetes:default/"));
}

#[test]
fn job_manifest_attaches_gpu_limit_only_when_positive() {
    let executor = KubernetesExecutor::with_runner(
        KubernetesSettings {
            gpu_limit: 2,
            job_ttl_seconds: 1200,
            ..in_cluster_settings()
        },
        Arc::new(FakeKubectl::default()),
    );
    let manifest = executor.build_job_manifest(&request(9014), "job-gpu", "{}");
    let limits = manifest
        .pointer("/spec/template/spec/containers/0/resources/limits")
        .unwrap();
    assert_eq!(limits["nvidia.com/gpu"], "2");
    assert_eq!(manifest["spec"]["ttlSecondsAfterFinished"], 1200);

    let executor = KubernetesExecutor::with_runner(
        KubernetesSettings {
            gpu_limit: 0,
            job_ttl_seconds: 1800,
            ..in_cluster_settings()
        },
        Arc::new(FakeKubectl::default()),
    );
    let manifest = executor.build_job_manifest(&request(9015), "job-cpu", "{}");
    let limits = manifest
        .pointer("/spec/template/spec/containers/0/resources/limits")
        .unwrap();
    assert!(limits.get("nvidia.com/gpu").is_none());
    assert_eq!(manifest["spec"]["ttlSecondsAfterFinished"], 1800);
}

#[test]
fn job_manifest_includes_pull_secrets_only_when_configured() {
    let executor = KubernetesExecutor::with_runner(
        KubernetesSettings {
            image_pull_secrets: vec!["registry-cred".to_string()],
            ..in_cluster_settings()
        },
        Arc::new(FakeKubectl::default()),
    );
    let manifest = executor.build_job_manifest(&request(9016), "job-secrets", "{}");
    let secrets = manifest
        .pointer("/spec/template/spec/imagePullSecrets")
        .unwrap();
    assert_eq!(secrets[0]["name"], "registry-cred");

    let executor = KubernetesExecutor::with_runner(
        in_cluster_settings(),
        Arc::new(FakeKubectl::default()),
    );
    let manifest = executor.build_job_manifest(&request(9017), "job-plain", "{}");
    assert!(manifest.pointer("/spec/template/spec/imagePullSecrets").is_none());
}

#[tokio::test]
async fn cancel_uses_grace_then_force() {
    let kubectl = Arc::new(FakeKubectl::default());
    let executor = KubernetesExecutor::with_runner(in_cluster_settings(), kubectl.clone());

    executor.cancel_job("job-x", 7, true).await.unwrap();

    let commands = kubectl.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].contains(&"--grace-period".to_string()));
    assert!(commands[0].contains(&"7".to_string()));
    assert!(commands[1].contains(&"--force".to_string()));
    assert!(commands[1].contains(&"0".to_string()));
}

#[tokio::test]
async fn prune_deletes_only_jobs_older_than_ttl() {
    let kubectl = Arc::new(FakeKubectl::default());
    let old = (chrono::Utc::now() - chrono::Duration::hours(30)).to_rfc3339();
    let recent = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
    *kubectl.job_status.lock() = json!({
        "items": [
            {"metadata": {"name": "job-old"}, "status": {"completionTime": old}},
            {"metadata": {"name": "job-recent"}, "status": {"completionTime": recent}},
            {"metadata": {"name": "job-running"}, "status": {}},
        ]
    });
    let executor = KubernetesExecutor::with_runner(in_cluster_settings(), kubectl.clone());

    let deleted = executor.prune_completed_jobs(7200).await.unwrap();
    assert_eq!(deleted, vec!["job-old".to_string()]);

    let delete_commands: Vec<_> = kubectl
        .commands()
        .into_iter()
        .filter(|args| FakeKubectl::verb(args) == "delete")
        .collect();
    assert_eq!(delete_commands.len(), 1);
    assert!(delete_commands[0].contains(&"job-old".to_string()));
}
