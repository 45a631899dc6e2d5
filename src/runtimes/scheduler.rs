//! Cooperative background scheduler for RAG source indexing.
//!
//! A single-process loop polls the store for sources whose `next_index_at`
//! is due. A source with an active job is skipped; otherwise a job is
//! launched through the [`IndexJobLauncher`] seam and the source's next
//! index time advances by its configured cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::model::RagSource;
use crate::tooling::ToolCallError;

use super::store::RunStore;

/// Seam over the external indexer that actually runs an index job.
#[async_trait]
pub trait IndexJobLauncher: Send + Sync {
    async fn launch(&self, source: &RagSource) -> Result<(), ToolCallError>;
}

/// Scheduler loop configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Base poll interval; each sleep gets up to 20% random jitter.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Advance a timestamp by `(value, unit)` where unit is one of
/// minutes/hours/days/weeks. Unknown units fall back to hours.
#[must_use]
pub fn advance_by_cadence(from: DateTime<Utc>, value: u32, unit: &str) -> DateTime<Utc> {
    let value = i64::from(value.max(1));
    let delta = match unit.trim().to_ascii_lowercase().as_str() {
        "minutes" => chrono::Duration::minutes(value),
        "days" => chrono::Duration::days(value),
        "weeks" => chrono::Duration::weeks(value),
        _ => chrono::Duration::hours(value),
    };
    from + delta
}

/// Cooperative scheduler over due RAG sources.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    launcher: Arc<dyn IndexJobLauncher>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        launcher: Arc<dyn IndexJobLauncher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
        }
    }

    /// One poll pass: launch every due source without an active job and
    /// advance its schedule. Returns the sources launched this pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Vec<i64> {
        let due = match self.store.due_rag_sources(now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(
                    target: "llmctl_engine::scheduler",
                    error = %err,
                    "due-source query failed"
                );
                return Vec::new();
            }
        };

        let mut launched = Vec::new();
        for mut source in due {
            if source.active_job {
                debug!(
                    target: "llmctl_engine::scheduler",
                    source_id = source.id,
                    "source already has an active job; skipping"
                );
                continue;
            }
            if let Err(err) = self.launcher.launch(&source).await {
                warn!(
                    target: "llmctl_engine::scheduler",
                    source_id = source.id,
                    error = %err,
                    "index job launch failed"
                );
                continue;
            }
            source.active_job = true;
            source.next_index_at = Some(advance_by_cadence(
                now,
                source.cadence_value,
                &source.cadence_unit,
            ));
            match self.store.save_rag_source(source.clone()).await {
                Ok(_) => launched.push(source.id),
                Err(err) => warn!(
                    target: "llmctl_engine::scheduler",
                    source_id = source.id,
                    error = %err,
                    "source schedule update failed"
                ),
            }
        }
        launched
    }

    /// Run the poll loop until the task is aborted.
    pub async fn run_forever(&self) {
        loop {
            let _ = self.run_once(Utc::now()).await;
            let jitter_ms = {
                let base = self.config.poll_interval.as_millis() as u64;
                let spread = (base / 5).max(1);
                rand::rng().random_range(0..spread)
            };
            tokio::time::sleep(self.config.poll_interval + Duration::from_millis(jitter_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cadence_units_advance_correctly() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            advance_by_cadence(start, 30, "minutes"),
            start + chrono::Duration::minutes(30)
        );
        assert_eq!(
            advance_by_cadence(start, 2, "days"),
            start + chrono::Duration::days(2)
        );
        assert_eq!(
            advance_by_cadence(start, 1, "weeks"),
            start + chrono::Duration::weeks(1)
        );
        // Unknown units fall back to hours; zero clamps to one.
        assert_eq!(
            advance_by_cadence(start, 0, "fortnights"),
            start + chrono::Duration::hours(1)
        );
    }
}
