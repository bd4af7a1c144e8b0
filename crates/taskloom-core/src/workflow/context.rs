//! Run-scoped orchestration context.
//!
//! One `OrchestrationContext` per execution holds the mutable state the
//! scheduler threads through a run: variables, terminal task results,
//! checkpoint markers, engine events, and per-action dispatch counters.
//! Only variables and results are checkpointed; events and counters are
//! observability data and are rebuilt from scratch on resume.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskloom_types::event::EngineEvent;
use taskloom_types::execution::{CheckpointKind, ContextSnapshot, TaskResult, TaskStatus};
use uuid::Uuid;

/// Variable key prefix under which successful task outputs are stored.
pub const OUTPUT_VARIABLE_PREFIX: &str = "tasks.";

/// Lightweight reference to a durable checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMarker {
    pub index: u64,
    pub task_id: String,
    pub kind: CheckpointKind,
}

/// Dispatch counters for one action within one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats {
    pub invocations: u32,
    pub successes: u32,
    pub transient_failures: u32,
    pub permanent_failures: u32,
    /// Calls refused by an open circuit.
    pub rejections: u32,
}

/// Execution-scoped mutable state.
#[derive(Debug)]
pub struct OrchestrationContext {
    execution_id: Uuid,
    workflow_id: Uuid,
    variables: Map<String, Value>,
    results: IndexMap<String, TaskResult>,
    /// Dispatched tasks without a terminal result yet. Never checkpointed.
    running: BTreeSet<String>,
    checkpoints: Vec<CheckpointMarker>,
    events: Vec<EngineEvent>,
    action_stats: BTreeMap<String, ActionStats>,
}

impl OrchestrationContext {
    pub fn new(execution_id: Uuid, workflow_id: Uuid, variables: Map<String, Value>) -> Self {
        Self {
            execution_id,
            workflow_id,
            variables,
            results: IndexMap::new(),
            running: BTreeSet::new(),
            checkpoints: Vec::new(),
            events: Vec::new(),
            action_stats: BTreeMap::new(),
        }
    }

    /// Rebuild a context from a checkpoint snapshot.
    pub fn from_snapshot(
        execution_id: Uuid,
        workflow_id: Uuid,
        snapshot: ContextSnapshot,
        last_checkpoint: Option<CheckpointMarker>,
    ) -> Self {
        let mut ctx = Self::new(execution_id, workflow_id, snapshot.variables);
        for result in snapshot.results {
            ctx.results.insert(result.task_id.clone(), result);
        }
        ctx.checkpoints.extend(last_checkpoint);
        ctx
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Output recorded for a succeeded task.
    pub fn task_output(&self, task_id: &str) -> Option<&Value> {
        self.variables.get(&format!("{OUTPUT_VARIABLE_PREFIX}{task_id}"))
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Record a terminal task result. A success also publishes its output
    /// as the variable `tasks.<task_id>`.
    pub fn record_result(&mut self, result: TaskResult) {
        if result.status == TaskStatus::Succeeded {
            if let Some(output) = &result.output {
                self.variables.insert(
                    format!("{OUTPUT_VARIABLE_PREFIX}{}", result.task_id),
                    output.clone(),
                );
            }
        }
        self.running.remove(&result.task_id);
        self.results.insert(result.task_id.clone(), result);
    }

    /// Mark a task as handed to its capability.
    pub fn mark_running(&mut self, task_id: &str) {
        self.running.insert(task_id.to_string());
    }

    /// Return a dispatched task to pending without recording an outcome.
    pub fn clear_running(&mut self, task_id: &str) {
        self.running.remove(task_id);
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Mark a failed task as recovered by its fallback.
    pub fn mark_recovered(&mut self, task_id: &str, fallback_id: &str) -> Option<&TaskResult> {
        let result = self.results.get_mut(task_id)?;
        result.recovered_by = Some(fallback_id.to_string());
        Some(result)
    }

    pub fn result(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.get(task_id)
    }

    /// Status of a task; tasks neither running nor recorded are `Pending`.
    pub fn status_of(&self, task_id: &str) -> TaskStatus {
        if self.running.contains(task_id) {
            return TaskStatus::Running;
        }
        self.results
            .get(task_id)
            .map(|r| r.status)
            .unwrap_or(TaskStatus::Pending)
    }

    /// Terminal results in recording order.
    pub fn results(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values()
    }

    pub fn completed_count(&self) -> usize {
        self.results.len()
    }

    pub fn last_task_id(&self) -> Option<&str> {
        self.results.keys().last().map(String::as_str)
    }

    /// Serializable state for a checkpoint.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            variables: self.variables.clone(),
            results: self.results.values().cloned().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub fn push_checkpoint(&mut self, marker: CheckpointMarker) {
        self.checkpoints.push(marker);
    }

    pub fn checkpoints(&self) -> &[CheckpointMarker] {
        &self.checkpoints
    }

    // -----------------------------------------------------------------------
    // Events and counters
    // -----------------------------------------------------------------------

    pub fn push_event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn action_stats(&self) -> &BTreeMap<String, ActionStats> {
        &self.action_stats
    }

    pub fn action_stats_mut(&mut self, action: &str) -> &mut ActionStats {
        self.action_stats.entry(action.to_string()).or_default()
    }
}
