//! Workflow repository trait definition.
//!
//! Defines the storage interface for version snapshots, executions with their
//! append-only task-result log, and checkpoints. Every write must be durable
//! when the returned future resolves; callers report status transitions only
//! after that.

use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{Checkpoint, Execution, ExecutionStatus, TaskResult};
use taskloom_types::workflow::{VersionSnapshot, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Versions:** immutable definition snapshots keyed by (workflow_id, version).
/// - **Executions:** run records plus an append-only task-result log.
/// - **Checkpoints:** ordered progress markers keyed by (execution_id, index).
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Append a new version, allocating `MAX(version) + 1` atomically.
    ///
    /// The stored definition carries the allocated version number.
    fn append_version(
        &self,
        workflow_id: &Uuid,
        definition: &WorkflowDefinition,
        created_by: &str,
        change_note: Option<&str>,
        body_hash: &str,
    ) -> impl std::future::Future<Output = Result<VersionSnapshot, RepositoryError>> + Send;

    fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<VersionSnapshot>, RepositoryError>> + Send;

    fn latest_version(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<VersionSnapshot>, RepositoryError>> + Send;

    /// All versions of a workflow, ascending.
    fn list_versions(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<VersionSnapshot>, RepositoryError>> + Send;

    /// Latest version of every workflow, ordered by name.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<VersionSnapshot>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set an execution's status. Terminal statuses also stamp `ended_at`.
    fn update_execution_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an execution with its results collapsed to the latest per task.
    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Executions of one workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Executions left `pending` or `running` (crash recovery).
    fn list_unfinished_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Count of executions per status.
    fn count_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(ExecutionStatus, usize)>, RepositoryError>> + Send;

    /// Append one non-terminal entry (a task starting, or returning to
    /// pending) to the task-result log. Terminal results go through
    /// `append_checkpoint` instead.
    fn append_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Raw task-result log in append order.
    fn list_task_results(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint and the task results it records, atomically.
    ///
    /// Fails with `Conflict` if the index already exists.
    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        results: &[TaskResult],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of an execution, ascending by index.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Delete checkpoints with `index < keep_from`. Returns the number removed.
    fn prune_checkpoints(
        &self,
        execution_id: &Uuid,
        keep_from: u64,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}

/// Collapse an append-only result log to the latest entry per task,
/// keeping each task at the position of its first entry.
pub fn collapse_results(log: Vec<TaskResult>) -> Vec<TaskResult> {
    let mut out: indexmap::IndexMap<String, TaskResult> = indexmap::IndexMap::new();
    for result in log {
        out.insert(result.task_id.clone(), result);
    }
    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_collapse_keeps_latest_at_first_position() {
        let now = Utc::now();
        let log = vec![
            TaskResult::failed("a", 1, "x", now),
            TaskResult::succeeded("b", 1, serde_json::Value::Null, now),
            {
                let mut r = TaskResult::failed("a", 1, "x", now);
                r.recovered_by = Some("b".into());
                r
            },
        ];
        let collapsed = collapse_results(log);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].task_id, "a");
        assert_eq!(collapsed[0].recovered_by.as_deref(), Some("b"));
        assert_eq!(collapsed[1].task_id, "b");
    }
}
