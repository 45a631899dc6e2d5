/*!
SQLite implementation of the [`RunStore`] capability.

Entity graphs (flowchart definitions, node-run state, artifact payloads) are
stored as JSON columns; every write method runs inside one transaction so the
unit-of-work contract matches the in-memory store exactly. The schema is
created on connect with `CREATE TABLE IF NOT EXISTS`, keeping deployments
free of external migration orchestration.

## Schema

- `flowcharts(id, name, definition_json)`: nodes and edges as one document
- `flowchart_runs(id, flowchart_id, status, timestamps, replay_of)`
- `flowchart_run_nodes(id, run_id, node_id, record_json)`
- `node_artifacts(id, run_id, node_run_id, idempotency_key UNIQUE, record_json)`
- `run_replays(run_id, idempotency_key, replay_run_id)`: keyed replay dedup
- `rag_sources(id, record_json, next_index_at)`
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::model::{Flowchart, FlowchartRun, FlowchartRunNode, NodeArtifact, RagSource};
use crate::types::{FlowchartId, NodeRunId, RunId, RunStatus};

use super::store::{ReplayOutcome, Result, RunStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flowcharts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    definition_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS flowchart_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flowchart_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    updated_at TEXT,
    replay_of INTEGER
);
CREATE TABLE IF NOT EXISTS flowchart_run_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS node_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    node_run_id INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS run_replays (
    run_id INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    replay_run_id INTEGER NOT NULL,
    PRIMARY KEY (run_id, idempotency_key)
);
CREATE TABLE IF NOT EXISTS rag_sources (
    id INTEGER PRIMARY KEY,
    record_json TEXT NOT NULL,
    next_index_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_run_nodes_run ON flowchart_run_nodes(run_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON node_artifacts(run_id);
"#;

fn backend_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

/// SQLite-backed run store.
pub struct SqliteRunStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRunStore").finish()
    }
}

impl SqliteRunStore {
    /// Connect (or create) the database at `database_url` and ensure the
    /// schema. Example URL: `sqlite://llmctl.db?mode=rwc`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await.map_err(backend_err)?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(backend_err)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FlowchartRun> {
        let parse_ts = |raw: Option<String>| -> Option<DateTime<Utc>> {
            raw.and_then(|text| DateTime::parse_from_rfc3339(&text).ok())
                .map(|parsed| parsed.with_timezone(&Utc))
        };
        let status_raw: String = row.get("status");
        Ok(FlowchartRun {
            id: row.get("id"),
            flowchart_id: row.get("flowchart_id"),
            status: RunStatus::decode(&status_raw).ok_or(StoreError::Backend {
                message: format!("unknown run status '{status_raw}'"),
            })?,
            created_at: parse_ts(Some(row.get("created_at"))).unwrap_or_else(Utc::now),
            started_at: parse_ts(row.get("started_at")),
            finished_at: parse_ts(row.get("finished_at")),
            updated_at: parse_ts(row.get("updated_at")),
            replay_of: row.get("replay_of"),
        })
    }

    async fn fetch_run(&self, id: RunId) -> Result<FlowchartRun> {
        let row = sqlx::query("SELECT * FROM flowchart_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound { entity: "run", id })?;
        Self::run_from_row(&row)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_flowchart(&self, mut flowchart: Flowchart) -> Result<Flowchart> {
        let definition = serde_json::to_string(&flowchart)?;
        let result = sqlx::query("INSERT INTO flowcharts (name, definition_json) VALUES (?, ?)")
            .bind(&flowchart.name)
            .bind(&definition)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend_err)?;
        if flowchart.id == 0 {
            flowchart.id = result.last_insert_rowid();
            for node in &mut flowchart.nodes {
                node.flowchart_id = flowchart.id;
            }
            let definition = serde_json::to_string(&flowchart)?;
            sqlx::query("UPDATE flowcharts SET definition_json = ? WHERE id = ?")
                .bind(&definition)
                .bind(flowchart.id)
                .execute(self.pool.as_ref())
                .await
                .map_err(backend_err)?;
        }
        Ok(flowchart)
    }

    async fn flowchart(&self, id: FlowchartId) -> Result<Flowchart> {
        let row = sqlx::query("SELECT definition_json FROM flowcharts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound {
                entity: "flowchart",
                id,
            })?;
        let definition: String = row.get("definition_json");
        Ok(serde_json::from_str(&definition)?)
    }

    async fn create_run(
        &self,
        flowchart_id: FlowchartId,
        replay_of: Option<RunId>,
    ) -> Result<FlowchartRun> {
        self.flowchart(flowchart_id).await?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO flowchart_runs (flowchart_id, status, created_at, updated_at, replay_of)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(flowchart_id)
        .bind(RunStatus::Queued.encode())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(replay_of)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        self.fetch_run(result.last_insert_rowid()).await
    }

    async fn run(&self, id: RunId) -> Result<FlowchartRun> {
        self.fetch_run(id).await
    }

    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<FlowchartRun> {
        let run = self.fetch_run(id).await?;
        let now = Utc::now();
        let started_at = if status == RunStatus::Running && run.started_at.is_none() {
            Some(now)
        } else {
            run.started_at
        };
        let finished_at = if status.is_terminal() {
            Some(now)
        } else {
            run.finished_at
        };
        sqlx::query(
            "UPDATE flowchart_runs
             SET status = ?, started_at = ?, finished_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.encode())
        .bind(started_at.map(|ts| ts.to_rfc3339()))
        .bind(finished_at.map(|ts| ts.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        self.fetch_run(id).await
    }

    async fn next_node_run_id(&self) -> Result<NodeRunId> {
        // Reserve an id by inserting a placeholder row the execution record
        // later overwrites.
        let result = sqlx::query(
            "INSERT INTO flowchart_run_nodes (run_id, node_id, record_json) VALUES (0, 0, '{}')",
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn record_node_execution(
        &self,
        mut node_run: FlowchartRunNode,
        mut artifacts: Vec<NodeArtifact>,
    ) -> Result<(FlowchartRunNode, Vec<NodeArtifact>)> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        if node_run.created_at.is_none() {
            node_run.created_at = Some(Utc::now());
        }
        if node_run.id == 0 {
            let result = sqlx::query(
                "INSERT INTO flowchart_run_nodes (run_id, node_id, record_json) VALUES (?, ?, '{}')",
            )
            .bind(node_run.flowchart_run_id)
            .bind(node_run.flowchart_node_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            node_run.id = result.last_insert_rowid();
        }
        let record = serde_json::to_string(&node_run)?;
        sqlx::query(
            "UPDATE flowchart_run_nodes SET run_id = ?, node_id = ?, record_json = ? WHERE id = ?",
        )
        .bind(node_run.flowchart_run_id)
        .bind(node_run.flowchart_node_id)
        .bind(&record)
        .bind(node_run.id)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        for artifact in &mut artifacts {
            artifact.flowchart_run_node_id = node_run.id;
            let record = serde_json::to_string(&artifact)?;
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO node_artifacts (run_id, node_run_id, idempotency_key, record_json)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(artifact.flowchart_run_id)
            .bind(artifact.flowchart_run_node_id)
            .bind(&artifact.idempotency_key)
            .bind(&record)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            if inserted.rows_affected() == 0 {
                // Duplicate key: roll everything back, no partial writes.
                tx.rollback().await.map_err(backend_err)?;
                return Err(StoreError::Conflict {
                    entity: "artifact",
                    key: artifact.idempotency_key.clone(),
                });
            }
            artifact.id = inserted.last_insert_rowid();
            // Persist the assigned id inside the same transaction.
            let record = serde_json::to_string(&artifact)?;
            sqlx::query("UPDATE node_artifacts SET record_json = ? WHERE id = ?")
                .bind(&record)
                .bind(artifact.id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }
        tx.commit().await.map_err(backend_err)?;
        Ok((node_run, artifacts))
    }

    async fn node_runs(&self, run_id: RunId) -> Result<Vec<FlowchartRunNode>> {
        let rows = sqlx::query(
            "SELECT record_json FROM flowchart_run_nodes WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        let mut node_runs = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.get("record_json");
            node_runs.push(serde_json::from_str(&record)?);
        }
        Ok(node_runs)
    }

    async fn artifacts(&self, run_id: RunId) -> Result<Vec<NodeArtifact>> {
        let rows =
            sqlx::query("SELECT record_json FROM node_artifacts WHERE run_id = ? ORDER BY id")
                .bind(run_id)
                .fetch_all(self.pool.as_ref())
                .await
                .map_err(backend_err)?;
        let mut artifacts = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.get("record_json");
            artifacts.push(serde_json::from_str(&record)?);
        }
        Ok(artifacts)
    }

    async fn record_replay(&self, run_id: RunId, idempotency_key: &str) -> Result<ReplayOutcome> {
        let source = self.fetch_run(run_id).await?;
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let existing = sqlx::query(
            "SELECT replay_run_id FROM run_replays WHERE run_id = ? AND idempotency_key = ?",
        )
        .bind(run_id)
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?;
        if let Some(row) = existing {
            let replay_id: i64 = row.get("replay_run_id");
            tx.commit().await.map_err(backend_err)?;
            let replay_run = self.fetch_run(replay_id).await?;
            return Ok(ReplayOutcome {
                replay_run,
                existing: true,
            });
        }
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO flowchart_runs (flowchart_id, status, created_at, updated_at, replay_of)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source.flowchart_id)
        .bind(RunStatus::Queued.encode())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        let replay_id = inserted.last_insert_rowid();
        sqlx::query(
            "INSERT INTO run_replays (run_id, idempotency_key, replay_run_id) VALUES (?, ?, ?)",
        )
        .bind(run_id)
        .bind(idempotency_key)
        .bind(replay_id)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        let replay_run = self.fetch_run(replay_id).await?;
        Ok(ReplayOutcome {
            replay_run,
            existing: false,
        })
    }

    async fn due_rag_sources(&self, now: DateTime<Utc>) -> Result<Vec<RagSource>> {
        let rows = sqlx::query(
            "SELECT record_json FROM rag_sources WHERE next_index_at IS NOT NULL AND next_index_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.get("record_json");
            sources.push(serde_json::from_str(&record)?);
        }
        Ok(sources)
    }

    async fn save_rag_source(&self, source: RagSource) -> Result<RagSource> {
        let record = serde_json::to_string(&source)?;
        sqlx::query(
            "INSERT INTO rag_sources (id, record_json, next_index_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET record_json = excluded.record_json,
                                           next_index_at = excluded.next_index_at",
        )
        .bind(source.id)
        .bind(&record)
        .bind(source.next_index_at.map(|ts| ts.to_rfc3339()))
        .execute(self.pool.as_ref())
        .await
        .map_err(backend_err)?;
        Ok(source)
    }
}
