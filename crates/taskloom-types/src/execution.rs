//! Execution-side types: executions, task results, checkpoints.
//!
//! An `Execution` pins one workflow version and is append-only until it
//! reaches a terminal status. Every terminal task outcome is appended to the
//! execution's task-result log together with a `Checkpoint` carrying the
//! context snapshot at that point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: '{other}'")),
        }
    }
}

/// Status of a single task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown task status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a pinned workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Exact definition version this execution runs.
    pub version: u32,
    pub status: ExecutionStatus,
    /// Variables supplied by the caller at dispatch time.
    #[serde(default)]
    pub initial_variables: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal task results in the order they were recorded.
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Create a new pending execution for the given workflow version.
    pub fn new(
        workflow_id: Uuid,
        version: u32,
        initial_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            version,
            status: ExecutionStatus::Pending,
            initial_variables,
            started_at: Utc::now(),
            ended_at: None,
            results: Vec::new(),
            error: None,
        }
    }

    /// Result recorded for a task, if any.
    pub fn result(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.iter().rev().find(|r| r.task_id == task_id)
    }
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Outcome of one task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Present only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the task was never dispatched. Present only when `status` is `Skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Fallback task whose success recovered this failed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn succeeded(
        task_id: impl Into<String>,
        attempts: u32,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Succeeded,
            attempt_count: attempts,
            output: Some(output),
            error: None,
            skip_reason: None,
            recovered_by: None,
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        attempts: u32,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            attempt_count: attempts,
            output: None,
            error: Some(error.into()),
            skip_reason: None,
            recovered_by: None,
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
        }
    }

    /// A task that was never dispatched.
    pub fn skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::waiting(task_id, TaskStatus::Skipped)
        }
    }

    /// A task handed to its capability and not yet finished.
    pub fn running(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..Self::waiting(task_id, TaskStatus::Running)
        }
    }

    /// A dispatched task returned to the ready queue without an outcome.
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self::waiting(task_id, TaskStatus::Pending)
    }

    fn waiting(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            attempt_count: 0,
            output: None,
            error: None,
            skip_reason: None,
            recovered_by: None,
            started_at: None,
            ended_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// What a checkpoint marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// A task reached a terminal status.
    Task,
    /// Final checkpoint written when an execution was cancelled.
    Cancelled,
}

impl CheckpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown checkpoint kind: '{other}'")),
        }
    }
}

/// Serialized context state captured at a checkpoint.
///
/// Each snapshot is complete: restoring the latest one reproduces the state
/// after every task it lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Terminal task results, in recording order.
    pub results: Vec<TaskResult>,
}

impl ContextSnapshot {
    /// Ids of tasks with a terminal result in this snapshot.
    pub fn completed_task_ids(&self) -> std::collections::BTreeSet<String> {
        self.results
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.task_id.clone())
            .collect()
    }
}

/// Durable, ordered progress marker for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: Uuid,
    /// Strictly increasing from 0 within an execution.
    pub index: u64,
    /// Task just recorded; for a `Cancelled` checkpoint, the last recorded task (may be empty).
    pub task_id: String,
    pub kind: CheckpointKind,
    pub snapshot: ContextSnapshot,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Progress / stats
// ---------------------------------------------------------------------------

/// Per-status task counts for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub pending: usize,
}

impl ExecutionProgress {
    /// Tally results against a workflow with `total` tasks.
    pub fn from_results(total: usize, results: &[TaskResult]) -> Self {
        let mut progress = Self {
            total,
            ..Self::default()
        };
        let mut seen = std::collections::HashSet::new();
        for r in results.iter().rev() {
            if !seen.insert(r.task_id.as_str()) {
                continue;
            }
            match r.status {
                TaskStatus::Succeeded => progress.succeeded += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Pending => {}
            }
        }
        progress.pending = total.saturating_sub(
            progress.succeeded + progress.failed + progress.skipped + progress.running,
        );
        progress
    }

    /// Fraction of tasks with a terminal outcome, in percent.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let done = self.succeeded + self.failed + self.skipped;
        (done as f64 / self.total as f64) * 100.0
    }
}

/// Aggregate execution counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub workflows: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ExecutionStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// Add one execution with the given status to the tally.
    pub fn record(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Pending => self.pending += 1,
            ExecutionStatus::Running => self.running += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
        }
    }
}
