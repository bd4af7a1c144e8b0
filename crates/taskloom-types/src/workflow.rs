//! Workflow definition types for Taskloom.
//!
//! A workflow is a declarative task graph: an ordered mapping of task ids to
//! tasks, each naming an external capability (`action`) and the tasks it
//! depends on. Definitions are authored as YAML (or JSON) and versioned
//! immutably through `VersionSnapshot`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// The canonical representation of a workflow.
///
/// `tasks` preserves declaration order, which the scheduler uses as the
/// second tie-break key after topological depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identity shared by every version.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    /// Owner of the workflow (user or team handle).
    #[serde(default)]
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Assigned by the version manager; `0` means "not yet versioned".
    #[serde(default)]
    pub version: u32,
    /// Tasks keyed by task id, in declaration order.
    pub tasks: IndexMap<String, TaskDefinition>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl WorkflowDefinition {
    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.get(task_id)
    }

    /// Declaration index of a task, if present.
    pub fn declaration_index(&self, task_id: &str) -> Option<usize> {
        self.tasks.get_index_of(task_id)
    }

    /// Compare two definitions ignoring the assigned version number.
    ///
    /// Two snapshots "have the same body" when everything but `version`
    /// matches, including task declaration order.
    pub fn same_body(&self, other: &WorkflowDefinition) -> bool {
        self.id == other.id
            && self.owner == other.owner
            && self.name == other.name
            && self.description == other.description
            && self.config == other.config
            && self.tasks.len() == other.tasks.len()
            && self
                .tasks
                .iter()
                .zip(other.tasks.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a == b)
    }

    /// Return a copy of this definition with the version field cleared.
    pub fn body(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            version: 0,
            ..self.clone()
        }
    }

    /// Task id that names `task_id` as its fallback, if any.
    pub fn fallback_owner(&self, task_id: &str) -> Option<&str> {
        self.tasks
            .iter()
            .find(|(_, t)| t.fallback.as_deref() == Some(task_id))
            .map(|(id, _)| id.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A single node in the workflow task graph.
///
/// The task id is the key in `WorkflowDefinition::tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Name of the external capability that performs this task.
    pub action: String,
    /// Opaque payload passed verbatim to the capability.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Predecessor task ids, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Overrides the workflow-level retry settings for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Tasks sharing a group are serialized relative to each other.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Overrides the workflow-level task timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Task to run if this one fails after exhausting retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// Run even when a predecessor failed or was skipped.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub run_on_failure: bool,
}

impl TaskDefinition {
    /// Convenience constructor for a task with no parameters or dependencies.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: serde_json::Map::new(),
            depends_on: Vec::new(),
            retry_policy: None,
            parallel_group: None,
            timeout_secs: None,
            fallback: None,
            run_on_failure: false,
        }
    }
}

/// Per-task retry override. Unset fields inherit from the workflow config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

/// Workflow-level execution settings.
///
/// Unset fields fall back to the engine configuration at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Retries after the first attempt for each task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Default per-task timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Fail the whole execution once a task fails without recovery.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Treat a skipped predecessor as satisfied instead of propagating the skip.
    #[serde(default)]
    pub skipped_satisfies_dependencies: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            timeout_secs: None,
            fail_fast: true,
            max_concurrency: None,
            skipped_satisfies_dependencies: false,
            base_delay_ms: None,
            max_delay_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// VersionSnapshot
// ---------------------------------------------------------------------------

/// Immutable point-in-time copy of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub workflow_id: Uuid,
    /// Monotonic, starting at 1.
    pub version: u32,
    pub definition: WorkflowDefinition,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_note: Option<String>,
    /// SHA-256 of the canonical body (definition without its version).
    pub body_hash: String,
}
