//! Stub seam implementations for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use llmctl_engine::nodes::{
    MemoryBackend, MilestoneBackend, ModelInvoker, NodeError, PlanBackend, RagClient,
};
use llmctl_engine::tooling::ToolCallError;

/// Model stub returning a canned response (or a scripted sequence).
#[derive(Default)]
pub struct StubModel {
    pub responses: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl StubModel {
    pub fn with_response(response: &str) -> Arc<Self> {
        let stub = Self::default();
        stub.responses.lock().push(response.to_string());
        Arc::new(stub)
    }

    pub fn push_response(&self, response: &str) {
        self.responses.lock().push(response.to_string());
    }
}

#[async_trait]
impl ModelInvoker for StubModel {
    async fn invoke(
        &self,
        _prompt_envelope: &Value,
        _model_id: Option<i64>,
    ) -> Result<String, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            Ok(r#"{"node_type": "task", "summary": "stub"}"#.to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// Memory backend stub with a scriptable failure plan.
#[derive(Default)]
pub struct StubMemoryBackend {
    /// Errors returned before the backend starts succeeding.
    pub failures: Mutex<Vec<ToolCallError>>,
    /// Result fragment for retrieve actions.
    pub retrieved: Mutex<Vec<Value>>,
    /// Number of leading retrieve calls that return no results.
    pub empty_retrieves: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl StubMemoryBackend {
    pub fn failing_times(times: usize, message: &str) -> Arc<Self> {
        let stub = Self::default();
        {
            let mut failures = stub.failures.lock();
            for _ in 0..times {
                failures.push(ToolCallError::msg(message));
            }
        }
        stub.retrieved.lock().push(json!({"id": 1, "description": "match"}));
        Arc::new(stub)
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MemoryBackend for StubMemoryBackend {
    async fn execute(&self, action: &str, _payload: Value) -> Result<Value, ToolCallError> {
        self.calls.lock().push(action.to_string());
        if let Some(err) = self.failures.lock().pop() {
            return Err(err);
        }
        match action {
            "retrieve" => {
                if self
                    .empty_retrieves
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Ok(json!({"retrieved_memories": []}));
                }
                Ok(json!({"retrieved_memories": self.retrieved.lock().clone()}))
            }
            _ => Ok(json!({"stored": true})),
        }
    }
}

#[derive(Default)]
pub struct StubMilestoneBackend {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl MilestoneBackend for StubMilestoneBackend {
    async fn execute(&self, action: &str, _payload: Value) -> Result<Value, ToolCallError> {
        self.calls.lock().push(action.to_string());
        Ok(json!({"id": 1, "title": "milestone", "status": if action == "mark_complete" { "complete" } else { "open" }}))
    }
}

#[derive(Default)]
pub struct StubPlanBackend {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl PlanBackend for StubPlanBackend {
    async fn execute(&self, action: &str, _payload: Value) -> Result<Value, ToolCallError> {
        self.calls.lock().push(action.to_string());
        Ok(json!({"id": 1, "items": [], "last_action": action}))
    }
}

#[derive(Default)]
pub struct StubRag {
    pub unavailable: bool,
}

#[async_trait]
impl RagClient for StubRag {
    async fn query(
        &self,
        collections: &[String],
        question: &str,
    ) -> Result<Value, ToolCallError> {
        if self.unavailable {
            return Err(ToolCallError::msg("rag unreachable"));
        }
        Ok(json!({"answer": format!("answer to {question}"), "collections": collections}))
    }

    async fn index(&self, collections: &[String], mode: &str) -> Result<Value, ToolCallError> {
        if self.unavailable {
            return Err(ToolCallError::msg("rag unreachable"));
        }
        Ok(json!({"indexed": collections, "mode": mode}))
    }
}
