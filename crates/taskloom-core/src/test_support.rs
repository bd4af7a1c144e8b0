//! Shared test doubles: scripted capabilities, a parameter-driven stub, and a
//! repository wrapper that injects checkpoint write failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use taskloom_types::error::{CapabilityError, RepositoryError};
use taskloom_types::execution::{Checkpoint, Execution, ExecutionStatus, TaskResult};
use taskloom_types::workflow::{TaskDefinition, VersionSnapshot, WorkflowDefinition};
use uuid::Uuid;

use crate::capability::Capability;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// ScriptedCapability
// ---------------------------------------------------------------------------

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Transient,
    Permanent,
    /// Never resolves.
    Hang,
}

/// Replays a fixed list of responses; `always` repeats one forever.
pub struct ScriptedCapability {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedCapability {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always(step: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            repeat: Some(step),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn next_step(&self) -> Step {
        let scripted = self.steps.lock().unwrap().pop_front();
        scripted
            .or_else(|| self.repeat.clone())
            .unwrap_or(Step::Permanent)
    }
}

impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        _action: &str,
        _parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Ok(value) => Ok(value),
            Step::Transient => Err(CapabilityError::transient("scripted transient failure")),
            Step::Permanent => Err(CapabilityError::permanent("scripted permanent failure")),
            Step::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// StubCapability
// ---------------------------------------------------------------------------

/// Deterministic capability driven by task parameters:
///
/// - `delay_ms`: sleep before answering
/// - `fail`: `"transient"` or `"permanent"` fails every call
/// - `fail_times` + `key`: fail transiently that many times per key, then succeed
/// - `output`: returned on success (defaults to `{"action": .., "params": ..}`)
///
/// Tracks concurrent invocations and their peak.
#[derive(Clone, Default)]
pub struct StubCapability {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    failures: Arc<Mutex<HashMap<String, u64>>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl StubCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `key` parameter of each invocation, in start order.
    pub fn started(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl Capability for StubCapability {
    fn name(&self) -> &str {
        "stub"
    }

    async fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = parameters
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.order.lock().unwrap().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = parameters.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match parameters.get("fail").and_then(Value::as_str) {
            Some("transient") => return Err(CapabilityError::transient("stub transient")),
            Some("permanent") => return Err(CapabilityError::permanent("stub permanent")),
            _ => {}
        }
        if let Some(limit) = parameters.get("fail_times").and_then(Value::as_u64) {
            let mut failures = self.failures.lock().unwrap();
            let seen = failures.entry(key).or_insert(0);
            if *seen < limit {
                *seen += 1;
                return Err(CapabilityError::transient("stub flaky"));
            }
        }

        Ok(parameters
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({ "action": action, "params": parameters })))
    }
}

// ---------------------------------------------------------------------------
// FaultyRepository
// ---------------------------------------------------------------------------

/// Delegates to `R` but fails `append_checkpoint` once `allow` appends have
/// succeeded, simulating a crash at that point.
#[derive(Clone)]
pub struct FaultyRepository<R> {
    inner: R,
    allow: usize,
    appended: Arc<AtomicUsize>,
}

impl<R: WorkflowRepository> FaultyRepository<R> {
    pub fn new(inner: R, allow: usize) -> Self {
        Self {
            inner,
            allow,
            appended: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: WorkflowRepository> WorkflowRepository for FaultyRepository<R> {
    async fn append_version(
        &self,
        workflow_id: &Uuid,
        definition: &WorkflowDefinition,
        created_by: &str,
        change_note: Option<&str>,
        body_hash: &str,
    ) -> Result<VersionSnapshot, RepositoryError> {
        self.inner
            .append_version(workflow_id, definition, created_by, change_note, body_hash)
            .await
    }

    async fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        self.inner.get_version(workflow_id, version).await
    }

    async fn latest_version(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        self.inner.latest_version(workflow_id).await
    }

    async fn list_versions(&self, workflow_id: &Uuid) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        self.inner.list_versions(workflow_id).await
    }

    async fn list_workflows(&self) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        self.inner.list_workflows().await
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.inner.create_execution(execution).await
    }

    async fn update_execution_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.inner
            .update_execution_status(execution_id, status, error)
            .await
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        self.inner.get_execution(execution_id).await
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        self.inner.list_executions(workflow_id, limit).await
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        self.inner.list_unfinished_executions().await
    }

    async fn count_executions(&self) -> Result<Vec<(ExecutionStatus, usize)>, RepositoryError> {
        self.inner.count_executions().await
    }

    async fn append_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> Result<(), RepositoryError> {
        self.inner.append_task_result(execution_id, result).await
    }

    async fn list_task_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        self.inner.list_task_results(execution_id).await
    }

    async fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        results: &[TaskResult],
    ) -> Result<(), RepositoryError> {
        if self.appended.load(Ordering::SeqCst) >= self.allow {
            return Err(RepositoryError::Query("injected write failure".into()));
        }
        self.inner.append_checkpoint(checkpoint, results).await?;
        self.appended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn latest_checkpoint(&self, execution_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        self.inner.latest_checkpoint(execution_id).await
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        self.inner.list_checkpoints(execution_id).await
    }

    async fn prune_checkpoints(&self, execution_id: &Uuid, keep_from: u64) -> Result<u64, RepositoryError> {
        self.inner.prune_checkpoints(execution_id, keep_from).await
    }
}

// ---------------------------------------------------------------------------
// Definition helpers
// ---------------------------------------------------------------------------

/// A task on the `stub` action keyed by its id.
pub fn stub_task(key: &str, deps: &[&str]) -> TaskDefinition {
    let mut task = TaskDefinition::new("stub");
    task.parameters.insert("key".into(), Value::from(key));
    task.depends_on = deps.iter().map(|d| d.to_string()).collect();
    task
}

/// A workflow of `stub` tasks given as `(id, deps)` pairs.
pub fn stub_workflow(name: &str, tasks: &[(&str, &[&str])]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition {
        id: Uuid::nil(),
        owner: "tests".to_string(),
        name: name.to_string(),
        description: None,
        version: 0,
        tasks: Default::default(),
        config: Default::default(),
    };
    for (id, deps) in tasks {
        def.tasks.insert(id.to_string(), stub_task(id, deps));
    }
    def
}

/// Set a parameter on one task of a definition.
pub fn set_param(def: &mut WorkflowDefinition, task_id: &str, key: &str, value: Value) {
    if let Some(task) = def.tasks.get_mut(task_id) {
        task.parameters.insert(key.to_string(), value);
    }
}
