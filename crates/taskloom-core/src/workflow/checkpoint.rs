//! Durable checkpoint store for execution progress.
//!
//! Wraps `WorkflowRepository` to append ordered checkpoints, restore the
//! latest one on resume, and prune history once an execution is terminal.
//! The scheduler is the only writer for a given execution and awaits each
//! append before recording the next, so indices are strictly sequential.

use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::DashMap;
use taskloom_types::execution::{Checkpoint, CheckpointKind, ContextSnapshot, TaskResult};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is still running; checkpoints are retained")]
    NotTerminal(Uuid),
}

/// The state needed to resume an execution.
#[derive(Debug, Clone)]
pub struct RestorePoint {
    pub checkpoint: Checkpoint,
    /// Tasks with a terminal result as of the checkpoint.
    pub completed: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend.
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
    next_index: DashMap<Uuid, u64>,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            next_index: DashMap::new(),
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Append a checkpoint after `task_id` reached a terminal status.
    ///
    /// `results` are appended to the execution's task-result log in the same
    /// write.
    pub async fn record(
        &self,
        execution_id: Uuid,
        task_id: &str,
        snapshot: ContextSnapshot,
        results: &[TaskResult],
    ) -> Result<Checkpoint, CheckpointError> {
        self.append(execution_id, task_id, CheckpointKind::Task, snapshot, results)
            .await
    }

    /// Append the final checkpoint of a cancelled execution.
    pub async fn record_cancelled(
        &self,
        execution_id: Uuid,
        last_task_id: Option<&str>,
        snapshot: ContextSnapshot,
    ) -> Result<Checkpoint, CheckpointError> {
        self.append(
            execution_id,
            last_task_id.unwrap_or_default(),
            CheckpointKind::Cancelled,
            snapshot,
            &[],
        )
        .await
    }

    /// Log a task's non-terminal transition (dispatched, or handed back to
    /// pending) without taking a checkpoint.
    pub async fn log_transition(
        &self,
        execution_id: Uuid,
        result: &TaskResult,
    ) -> Result<(), CheckpointError> {
        self.repo
            .append_task_result(&execution_id, result)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    async fn append(
        &self,
        execution_id: Uuid,
        task_id: &str,
        kind: CheckpointKind,
        snapshot: ContextSnapshot,
        results: &[TaskResult],
    ) -> Result<Checkpoint, CheckpointError> {
        let index = self.peek_next_index(execution_id).await?;
        let checkpoint = Checkpoint {
            execution_id,
            index,
            task_id: task_id.to_string(),
            kind,
            snapshot,
            created_at: Utc::now(),
        };

        self.repo
            .append_checkpoint(&checkpoint, results)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        self.next_index.insert(execution_id, index + 1);

        tracing::debug!(
            execution_id = %execution_id,
            index,
            task_id,
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    async fn peek_next_index(&self, execution_id: Uuid) -> Result<u64, CheckpointError> {
        if let Some(next) = self.next_index.get(&execution_id) {
            return Ok(*next);
        }
        let latest = self
            .repo
            .latest_checkpoint(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        Ok(latest.map(|c| c.index + 1).unwrap_or(0))
    }

    /// The latest checkpoint plus the tasks it marks complete, or `None` if
    /// the execution never checkpointed.
    pub async fn restore(&self, execution_id: Uuid) -> Result<Option<RestorePoint>, CheckpointError> {
        let latest = self
            .repo
            .latest_checkpoint(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        Ok(latest.map(|checkpoint| {
            self.next_index.insert(execution_id, checkpoint.index + 1);
            let completed = checkpoint.snapshot.completed_task_ids();
            tracing::info!(
                execution_id = %execution_id,
                index = checkpoint.index,
                completed = completed.len(),
                "restored from checkpoint"
            );
            RestorePoint {
                checkpoint,
                completed,
            }
        }))
    }

    pub async fn list(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.repo
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Drop every checkpoint but the latest. Only allowed once the execution
    /// is terminal.
    pub async fn prune(&self, execution_id: Uuid) -> Result<u64, CheckpointError> {
        let execution = self
            .repo
            .get_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))?;
        if !execution.status.is_terminal() {
            return Err(CheckpointError::NotTerminal(execution_id));
        }

        let Some(latest) = self
            .repo
            .latest_checkpoint(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
        else {
            return Ok(0);
        };

        let removed = self
            .repo
            .prune_checkpoints(&execution_id, latest.index)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(execution_id = %execution_id, removed, "pruned checkpoints");
        Ok(removed)
    }

    /// Drop cached index state for an execution that will not write again.
    pub fn forget(&self, execution_id: Uuid) {
        self.next_index.remove(&execution_id);
    }
}
