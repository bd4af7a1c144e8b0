//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `taskloom-core` using sqlx with split
//! read/write pools. Definitions, variables and snapshots are stored as JSON
//! text. Every multi-row write runs in a single transaction on the writer.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use taskloom_core::repository::workflow::{WorkflowRepository, collapse_results};
use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{
    Checkpoint, CheckpointKind, ContextSnapshot, Execution, ExecutionStatus, TaskResult, TaskStatus,
};
use taskloom_types::workflow::{VersionSnapshot, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM task_results WHERE execution_id = ? ORDER BY seq ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| TaskResultRow::from_row(row).map_err(query_err)?.into_result())
            .collect()
    }

    async fn with_results(&self, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut execution = ExecutionRow::from_row(row).map_err(query_err)?.into_execution()?;
            execution.results = collapse_results(self.load_results(&execution.id).await?);
            executions.push(execution);
        }
        Ok(executions)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct VersionRow {
    workflow_id: String,
    version: i64,
    definition_json: String,
    body_hash: String,
    created_by: String,
    change_note: Option<String>,
    created_at: String,
}

impl VersionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            definition_json: row.try_get("definition_json")?,
            body_hash: row.try_get("body_hash")?,
            created_by: row.try_get("created_by")?,
            change_note: row.try_get("change_note")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_snapshot(self) -> Result<VersionSnapshot, RepositoryError> {
        let definition: WorkflowDefinition = serde_json::from_str(&self.definition_json)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;
        Ok(VersionSnapshot {
            workflow_id: parse_uuid(&self.workflow_id)?,
            version: self.version as u32,
            definition,
            created_by: self.created_by,
            created_at: parse_datetime(&self.created_at)?,
            change_note: self.change_note,
            body_hash: self.body_hash,
        })
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    version: i64,
    status: String,
    initial_variables: String,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            initial_variables: row.try_get("initial_variables")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let initial_variables = serde_json::from_str(&self.initial_variables)
            .map_err(|e| RepositoryError::Query(format!("invalid initial_variables: {e}")))?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            version: self.version as u32,
            status,
            initial_variables,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            results: Vec::new(),
            error: self.error,
        })
    }
}

struct TaskResultRow {
    task_id: String,
    status: String,
    attempt_count: i64,
    output_json: Option<String>,
    error: Option<String>,
    skip_reason: Option<String>,
    recovered_by: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl TaskResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            output_json: row.try_get("output_json")?,
            error: row.try_get("error")?,
            skip_reason: row.try_get("skip_reason")?,
            recovered_by: row.try_get("recovered_by")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_result(self) -> Result<TaskResult, RepositoryError> {
        let status: TaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let output = self
            .output_json
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid task output: {e}")))
            })
            .transpose()?;

        Ok(TaskResult {
            task_id: self.task_id,
            status,
            attempt_count: self.attempt_count as u32,
            output,
            error: self.error,
            skip_reason: self.skip_reason,
            recovered_by: self.recovered_by,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct CheckpointRow {
    execution_id: String,
    idx: i64,
    task_id: String,
    kind: String,
    snapshot_json: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            idx: row.try_get("idx")?,
            task_id: row.try_get("task_id")?,
            kind: row.try_get("kind")?,
            snapshot_json: row.try_get("snapshot_json")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let kind: CheckpointKind = self.kind.parse().map_err(RepositoryError::Query)?;
        let snapshot: ContextSnapshot = serde_json::from_str(&self.snapshot_json)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint snapshot: {e}")))?;
        Ok(Checkpoint {
            execution_id: parse_uuid(&self.execution_id)?,
            index: self.idx as u64,
            task_id: self.task_id,
            kind,
            snapshot,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map constraint violations to the repository's conflict / not-found errors.
fn write_err(e: sqlx::Error, what: impl FnOnce() -> String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        let message = db_err.message();
        if message.contains("UNIQUE") || message.contains("PRIMARY KEY") {
            return RepositoryError::Conflict(what());
        }
        if message.contains("FOREIGN KEY") {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::Query(e.to_string())
}

/// Append one row to the task-result log.
async fn insert_result<'e, E>(
    executor: E,
    execution_id: &str,
    result: &TaskResult,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let output_json = result
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(query_err)?;

    sqlx::query(
        r#"INSERT INTO task_results
           (execution_id, task_id, status, attempt_count, output_json, error, skip_reason,
            recovered_by, started_at, ended_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(execution_id)
    .bind(&result.task_id)
    .bind(result.status.as_str())
    .bind(result.attempt_count)
    .bind(&output_json)
    .bind(&result.error)
    .bind(&result.skip_reason)
    .bind(&result.recovered_by)
    .bind(result.started_at.as_ref().map(format_datetime))
    .bind(result.ended_at.as_ref().map(format_datetime))
    .execute(executor)
    .await
    .map_err(|e| write_err(e, || format!("duplicate result for task '{}'", result.task_id)))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn append_version(
        &self,
        workflow_id: &Uuid,
        definition: &WorkflowDefinition,
        created_by: &str,
        change_note: Option<&str>,
        body_hash: &str,
    ) -> Result<VersionSnapshot, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let (next,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_versions WHERE workflow_id = ?",
        )
        .bind(workflow_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;

        let mut definition = definition.clone();
        definition.id = *workflow_id;
        definition.version = next as u32;
        let definition_json = serde_json::to_string(&definition)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let created_at = Utc::now();

        sqlx::query(
            r#"INSERT INTO workflow_versions
               (workflow_id, version, name, owner, definition_json, body_hash, created_by, change_note, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(workflow_id.to_string())
        .bind(next)
        .bind(&definition.name)
        .bind(&definition.owner)
        .bind(&definition_json)
        .bind(body_hash)
        .bind(created_by)
        .bind(change_note)
        .bind(format_datetime(&created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            write_err(e, || {
                format!("version {next} already exists for workflow {workflow_id}")
            })
        })?;

        tx.commit().await.map_err(query_err)?;

        Ok(VersionSnapshot {
            workflow_id: *workflow_id,
            version: next as u32,
            definition,
            created_by: created_by.to_string(),
            created_at,
            change_note: change_note.map(str::to_string),
            body_hash: body_hash.to_string(),
        })
    }

    async fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_versions WHERE workflow_id = ? AND version = ?")
            .bind(workflow_id.to_string())
            .bind(version)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|r| VersionRow::from_row(&r).map_err(query_err)?.into_snapshot())
            .transpose()
    }

    async fn latest_version(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|r| VersionRow::from_row(&r).map_err(query_err)?.into_snapshot())
            .transpose()
    }

    async fn list_versions(&self, workflow_id: &Uuid) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_versions WHERE workflow_id = ? ORDER BY version ASC")
            .bind(workflow_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|r| VersionRow::from_row(r).map_err(query_err)?.into_snapshot())
            .collect()
    }

    async fn list_workflows(&self) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT v.* FROM workflow_versions v
               JOIN (SELECT workflow_id, MAX(version) AS latest
                     FROM workflow_versions GROUP BY workflow_id) m
                 ON v.workflow_id = m.workflow_id AND v.version = m.latest
               ORDER BY v.name ASC, v.workflow_id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|r| VersionRow::from_row(r).map_err(query_err)?.into_snapshot())
            .collect()
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let variables = serde_json::to_string(&execution.initial_variables)
            .map_err(|e| RepositoryError::Query(format!("serialize variables: {e}")))?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, version, status, initial_variables, error, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.version)
        .bind(execution.status.as_str())
        .bind(&variables)
        .bind(&execution.error)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| write_err(e, || format!("execution {} already exists", execution.id)))?;

        Ok(())
    }

    async fn update_execution_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let ended_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        let result = sqlx::query(
            r#"UPDATE executions
               SET status = ?,
                   error = COALESCE(?, error),
                   ended_at = COALESCE(?, ended_at)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&ended_at)
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(self.with_results(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE workflow_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        self.with_results(rows).await
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE status IN ('pending', 'running') ORDER BY started_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        self.with_results(rows).await
    }

    async fn count_executions(&self) -> Result<Vec<(ExecutionStatus, usize)>, RepositoryError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM executions GROUP BY status ORDER BY status ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.into_iter()
            .map(|(status, n)| {
                let status: ExecutionStatus = status.parse().map_err(RepositoryError::Query)?;
                Ok((status, n as usize))
            })
            .collect()
    }

    async fn append_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> Result<(), RepositoryError> {
        insert_result(&self.pool.writer, &execution_id.to_string(), result).await
    }

    async fn list_task_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        self.load_results(execution_id).await
    }

    async fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        results: &[TaskResult],
    ) -> Result<(), RepositoryError> {
        let snapshot_json = serde_json::to_string(&checkpoint.snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;
        let execution_id = checkpoint.execution_id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO checkpoints (execution_id, idx, task_id, kind, snapshot_json, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&execution_id)
        .bind(checkpoint.index as i64)
        .bind(&checkpoint.task_id)
        .bind(checkpoint.kind.as_str())
        .bind(&snapshot_json)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            write_err(e, || {
                format!(
                    "checkpoint {} already exists for execution {}",
                    checkpoint.index, checkpoint.execution_id
                )
            })
        })?;

        for result in results {
            insert_result(&mut *tx, &execution_id, result).await?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn latest_checkpoint(&self, execution_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY idx DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|r| CheckpointRow::from_row(&r).map_err(query_err)?.into_checkpoint())
            .transpose()
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY idx ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|r| CheckpointRow::from_row(r).map_err(query_err)?.into_checkpoint())
            .collect()
    }

    async fn prune_checkpoints(&self, execution_id: &Uuid, keep_from: u64) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE execution_id = ? AND idx < ?")
            .bind(execution_id.to_string())
            .bind(keep_from as i64)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }
}
