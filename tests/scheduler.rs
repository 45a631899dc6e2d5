use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use llmctl_engine::model::RagSource;
use llmctl_engine::runtimes::scheduler::advance_by_cadence;
use llmctl_engine::runtimes::{
    IndexJobLauncher, InMemoryRunStore, RunStore, Scheduler, SchedulerConfig,
};
use llmctl_engine::tooling::ToolCallError;

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<i64>>,
    fail_ids: Vec<i64>,
}

#[async_trait]
impl IndexJobLauncher for RecordingLauncher {
    async fn launch(&self, source: &RagSource) -> Result<(), ToolCallError> {
        if self.fail_ids.contains(&source.id) {
            return Err(ToolCallError::msg("indexer offline"));
        }
        self.launched.lock().push(source.id);
        Ok(())
    }
}

fn source(id: i64, due_offset_minutes: i64, active_job: bool) -> RagSource {
    RagSource {
        id,
        name: format!("source-{id}"),
        next_index_at: Some(Utc::now() + Duration::minutes(due_offset_minutes)),
        cadence_value: 2,
        cadence_unit: "hours".to_string(),
        active_job,
    }
}

#[tokio::test]
async fn due_sources_launch_and_advance_their_schedule() {
    let store = Arc::new(InMemoryRunStore::new());
    store.save_rag_source(source(1, -5, false)).await.unwrap();
    store.save_rag_source(source(2, 30, false)).await.unwrap();

    let launcher = Arc::new(RecordingLauncher::default());
    let scheduler = Scheduler::new(store.clone(), launcher.clone(), SchedulerConfig::default());

    let now = Utc::now();
    let launched = scheduler.run_once(now).await;
    assert_eq!(launched, vec![1]);
    assert_eq!(launcher.launched.lock().clone(), vec![1]);

    // Source 1 advanced by its cadence and is no longer due.
    let due_again = store.due_rag_sources(now).await.unwrap();
    assert!(due_again.is_empty());
    let later = now + Duration::hours(3);
    let due_later = store.due_rag_sources(later).await.unwrap();
    assert!(due_later.iter().any(|s| s.id == 1));
}

#[tokio::test]
async fn sources_with_active_jobs_are_skipped() {
    let store = Arc::new(InMemoryRunStore::new());
    store.save_rag_source(source(3, -5, true)).await.unwrap();

    let launcher = Arc::new(RecordingLauncher::default());
    let scheduler = Scheduler::new(store.clone(), launcher.clone(), SchedulerConfig::default());

    let launched = scheduler.run_once(Utc::now()).await;
    assert!(launched.is_empty());
    assert!(launcher.launched.lock().is_empty());
}

#[tokio::test]
async fn launch_failures_leave_the_schedule_unchanged() {
    let store = Arc::new(InMemoryRunStore::new());
    store.save_rag_source(source(4, -5, false)).await.unwrap();

    let launcher = Arc::new(RecordingLauncher {
        fail_ids: vec![4],
        ..RecordingLauncher::default()
    });
    let scheduler = Scheduler::new(store.clone(), launcher, SchedulerConfig::default());

    let now = Utc::now();
    let launched = scheduler.run_once(now).await;
    assert!(launched.is_empty());
    // Still due on the next pass.
    let due = store.due_rag_sources(now).await.unwrap();
    assert_eq!(due.len(), 1);
}

#[test]
fn cadence_advancement_covers_every_unit() {
    let start = Utc::now();
    assert_eq!(advance_by_cadence(start, 15, "minutes"), start + Duration::minutes(15));
    assert_eq!(advance_by_cadence(start, 4, "hours"), start + Duration::hours(4));
    assert_eq!(advance_by_cadence(start, 1, "days"), start + Duration::days(1));
    assert_eq!(advance_by_cadence(start, 2, "weeks"), start + Duration::weeks(2));
}
