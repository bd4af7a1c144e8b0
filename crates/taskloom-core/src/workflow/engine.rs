//! Workflow engine: the submission interface tying versions, scheduling,
//! checkpoints and recovery together.
//!
//! # Execution flow
//!
//! 1. `execute` writes the `Execution` record (write-ahead), marks it
//!    `running`, and spawns a driver task.
//! 2. The driver runs the `Scheduler` to a terminal outcome, checkpointing
//!    every terminal task result.
//! 3. The final status is persisted, then broadcast as `ExecutionFinished`.
//!
//! An execution left `pending`/`running` by a previous process is picked up
//! by `resume`/`recover_interrupted` from its latest checkpoint.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use taskloom_types::config::{EngineConfig, SchedulerSettings};
use taskloom_types::event::EngineEvent;
use taskloom_types::execution::{
    Checkpoint, ContextSnapshot, Execution, ExecutionProgress, ExecutionStats, ExecutionStatus,
};
use taskloom_types::workflow::{VersionSnapshot, WorkflowDefinition};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breaker::BreakerRegistry;
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{CheckpointMarker, OrchestrationContext};
use super::definition::{DefinitionError, validate_definition};
use super::retry::RetryCoordinator;
use super::scheduler::{RunOutcome, Scheduler};
use super::version::{VersionError, VersionManager};
use crate::capability::CapabilityRegistry;
use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

/// How often a running execution checks whether another process cancelled it.
const EXTERNAL_CANCEL_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {id} is {status} and cannot be resumed")]
    NotResumable { id: Uuid, status: ExecutionStatus },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("engine repository error: {0}")]
    Repository(String),
}

fn repo_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Repository(e.to_string())
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct ActiveExecution {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecutionStatus>>,
}

struct EngineInner<R: WorkflowRepository> {
    repo: R,
    versions: VersionManager<R>,
    checkpoints: Arc<CheckpointManager<R>>,
    scheduler: Scheduler<R>,
    event_bus: EventBus,
    settings: SchedulerSettings,
    active: DashMap<Uuid, ActiveExecution>,
}

/// The orchestration engine.
///
/// Cheap to clone; clones share the same executions, breakers and event bus.
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository + Clone + 'static> {
    inner: Arc<EngineInner<R>>,
}

impl<R: WorkflowRepository + Clone + 'static> Clone for WorkflowEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: WorkflowRepository + Clone + 'static> WorkflowEngine<R> {
    pub fn new(repo: R, registry: CapabilityRegistry, config: &EngineConfig) -> Self {
        let event_bus = EventBus::new(config.engine.event_capacity);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let coordinator = RetryCoordinator::new(Arc::new(registry), breakers, event_bus.clone());
        let checkpoints = Arc::new(CheckpointManager::new(repo.clone()));
        let scheduler = Scheduler::new(
            Arc::clone(&checkpoints),
            coordinator,
            event_bus.clone(),
            config.engine.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                versions: VersionManager::new(repo.clone()),
                repo,
                checkpoints,
                scheduler,
                event_bus,
                settings: config.engine.clone(),
                active: DashMap::new(),
            }),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn repository(&self) -> &R {
        &self.inner.repo
    }

    /// Number of executions driven by this engine right now.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Validate and store a definition as the next version of its workflow.
    ///
    /// A definition without an id starts a new workflow.
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
        author: &str,
        note: Option<&str>,
    ) -> Result<VersionSnapshot, EngineError> {
        let workflow_id = if definition.id.is_nil() {
            Uuid::now_v7()
        } else {
            definition.id
        };
        Ok(self
            .inner
            .versions
            .snapshot(workflow_id, definition, author, note)
            .await?)
    }

    pub async fn rollback(
        &self,
        workflow_id: Uuid,
        target_version: u32,
        author: &str,
    ) -> Result<VersionSnapshot, EngineError> {
        Ok(self
            .inner
            .versions
            .rollback(workflow_id, target_version, author)
            .await?)
    }

    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<VersionSnapshot>, EngineError> {
        Ok(self.inner.versions.history(workflow_id).await?)
    }

    pub async fn get_version(
        &self,
        workflow_id: Uuid,
        version: Option<u32>,
    ) -> Result<VersionSnapshot, EngineError> {
        Ok(self.inner.versions.get(workflow_id, version).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<VersionSnapshot>, EngineError> {
        Ok(self.inner.versions.list().await?)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Start an execution of `version` (latest when `None`) and return its id
    /// once the record is durable. The run itself proceeds in the background.
    #[tracing::instrument(name = "engine.execute", skip_all, fields(workflow_id = %workflow_id, version = ?version))]
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        version: Option<u32>,
        variables: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let snapshot = self.inner.versions.get(workflow_id, version).await?;
        validate_definition(&snapshot.definition)?;

        let execution = Execution::new(workflow_id, snapshot.version, variables.clone());
        self.inner
            .repo
            .create_execution(&execution)
            .await
            .map_err(repo_err)?;

        let ctx = OrchestrationContext::new(execution.id, workflow_id, variables);
        self.launch(snapshot, ctx, false).await?;
        Ok(execution.id)
    }

    /// Restart a non-terminal execution from its latest checkpoint.
    ///
    /// Returns immediately if this engine is already driving it. Nothing in
    /// storage marks an execution as owned, so only one process may resume
    /// executions against a given database at a time. A second process
    /// resuming the same execution would run its tasks twice.
    pub async fn resume(&self, execution_id: Uuid) -> Result<Uuid, EngineError> {
        if self.inner.active.contains_key(&execution_id) {
            return Ok(execution_id);
        }
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::NotResumable {
                id: execution_id,
                status: execution.status,
            });
        }

        let snapshot = self
            .inner
            .versions
            .get(execution.workflow_id, Some(execution.version))
            .await?;
        let ctx = match self.inner.checkpoints.restore(execution_id).await? {
            Some(point) => {
                let marker = CheckpointMarker {
                    index: point.checkpoint.index,
                    task_id: point.checkpoint.task_id.clone(),
                    kind: point.checkpoint.kind,
                };
                OrchestrationContext::from_snapshot(
                    execution_id,
                    execution.workflow_id,
                    point.checkpoint.snapshot,
                    Some(marker),
                )
            }
            None => OrchestrationContext::new(
                execution_id,
                execution.workflow_id,
                execution.initial_variables,
            ),
        };

        tracing::info!(
            execution_id = %execution_id,
            restored = ctx.completed_count(),
            "resuming execution"
        );
        self.launch(snapshot, ctx, true).await?;
        Ok(execution_id)
    }

    /// Resume every execution a previous process left unfinished.
    ///
    /// Assumes this is the only process using the database; every
    /// non-terminal execution is treated as abandoned.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, EngineError> {
        let unfinished = self
            .inner
            .repo
            .list_unfinished_executions()
            .await
            .map_err(repo_err)?;

        let mut resumed = Vec::new();
        for execution in unfinished {
            if self.inner.active.contains_key(&execution.id) {
                continue;
            }
            match self.resume(execution.id).await {
                Ok(id) => resumed.push(id),
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        error = %e,
                        "failed to recover execution"
                    );
                }
            }
        }
        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "recovered interrupted executions");
        }
        Ok(resumed)
    }

    async fn launch(
        &self,
        snapshot: VersionSnapshot,
        ctx: OrchestrationContext,
        resumed: bool,
    ) -> Result<(), EngineError> {
        let execution_id = ctx.execution_id();
        self.inner
            .repo
            .update_execution_status(&execution_id, ExecutionStatus::Running, None)
            .await
            .map_err(repo_err)?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        self.inner.active.insert(
            execution_id,
            ActiveExecution {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = drive(&inner, snapshot, ctx, cancel, resumed).await;
            let _ = done_tx.send(Some(status));
            inner.active.remove(&execution_id);
        });
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.inner
            .repo
            .get_execution(&execution_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// The most recent durable state of an execution.
    pub async fn status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.load(execution_id).await
    }

    /// Wait until the execution is terminal, then return it.
    ///
    /// For an execution not driven by this engine, returns the stored state.
    pub async fn wait(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let done = self
            .inner
            .active
            .get(&execution_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the driver already finished.
            let _ = done.wait_for(Option::is_some).await;
        }
        self.load(execution_id).await
    }

    /// Task counts for an execution against its workflow version.
    pub async fn progress(&self, execution_id: Uuid) -> Result<ExecutionProgress, EngineError> {
        let execution = self.load(execution_id).await?;
        let snapshot = self
            .inner
            .versions
            .get(execution.workflow_id, Some(execution.version))
            .await?;
        Ok(ExecutionProgress::from_results(
            snapshot.definition.tasks.len(),
            &execution.results,
        ))
    }

    /// Request cancellation.
    ///
    /// A running execution stops dispatching, drains in-flight tasks, and
    /// finishes `cancelled`. An unfinished execution no process is driving is
    /// cancelled in place. Cancelling a terminal execution is a no-op.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        if let Some(active) = self.inner.active.get(&execution_id) {
            tracing::info!(execution_id = %execution_id, "cancellation requested");
            active.cancel.cancel();
            return Ok(());
        }

        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        let latest = self.inner.checkpoints.restore(execution_id).await?;
        let (last_task, snapshot) = match latest {
            Some(point) => (Some(point.checkpoint.task_id), point.checkpoint.snapshot),
            None => (
                None,
                ContextSnapshot {
                    variables: execution.initial_variables,
                    results: Vec::new(),
                },
            ),
        };
        self.inner
            .checkpoints
            .record_cancelled(execution_id, last_task.as_deref(), snapshot)
            .await?;
        self.inner
            .repo
            .update_execution_status(&execution_id, ExecutionStatus::Cancelled, None)
            .await
            .map_err(repo_err)?;
        self.inner.checkpoints.forget(execution_id);

        tracing::info!(execution_id = %execution_id, "cancelled detached execution");
        self.inner.event_bus.publish(EngineEvent::ExecutionFinished {
            execution_id,
            status: ExecutionStatus::Cancelled,
        });
        Ok(())
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, EngineError> {
        self.inner
            .repo
            .list_executions(&workflow_id, limit)
            .await
            .map_err(repo_err)
    }

    pub async fn checkpoints(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        self.load(execution_id).await?;
        Ok(self.inner.checkpoints.list(execution_id).await?)
    }

    /// Execution counts by status, plus the number of workflows.
    pub async fn stats(&self) -> Result<ExecutionStats, EngineError> {
        let counts = self.inner.repo.count_executions().await.map_err(repo_err)?;
        let workflows = self.inner.repo.list_workflows().await.map_err(repo_err)?;

        let mut stats = ExecutionStats {
            workflows: workflows.len(),
            ..Default::default()
        };
        for (status, n) in counts {
            for _ in 0..n {
                stats.record(status);
            }
        }
        Ok(stats)
    }

    /// Cancel every execution this engine is driving and wait for them.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.inner.active.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some(active) = self.inner.active.get(id) {
                active.cancel.cancel();
            }
        }
        for id in ids {
            let _ = self.wait(id).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run one execution to a terminal status and persist it.
async fn drive<R: WorkflowRepository + Clone + 'static>(
    inner: &EngineInner<R>,
    snapshot: VersionSnapshot,
    mut ctx: OrchestrationContext,
    cancel: CancellationToken,
    resumed: bool,
) -> ExecutionStatus {
    let execution_id = ctx.execution_id();
    inner.event_bus.publish(EngineEvent::ExecutionStarted {
        execution_id,
        workflow_id: snapshot.workflow_id,
        version: snapshot.version,
        resumed,
    });

    let watcher = tokio::spawn(watch_external_cancel(
        inner.repo.clone(),
        execution_id,
        cancel.clone(),
    ));

    let outcome = match validate_definition(&snapshot.definition) {
        Ok(graph) => {
            match inner
                .scheduler
                .run(&snapshot.definition, &graph, &mut ctx, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "execution aborted by checkpoint failure"
                    );
                    RunOutcome {
                        status: ExecutionStatus::Failed,
                        error: Some(e.to_string()),
                    }
                }
            }
        }
        Err(e) => RunOutcome {
            status: ExecutionStatus::Failed,
            error: Some(e.to_string()),
        },
    };
    watcher.abort();

    let status = finish(inner, execution_id, outcome).await;
    inner.checkpoints.forget(execution_id);
    status
}

async fn finish<R: WorkflowRepository>(
    inner: &EngineInner<R>,
    execution_id: Uuid,
    outcome: RunOutcome,
) -> ExecutionStatus {
    // Another process may have cancelled the record meanwhile; keep its verdict.
    let stored = inner.repo.get_execution(&execution_id).await;
    if let Ok(Some(existing)) = &stored {
        if existing.status.is_terminal() {
            inner.event_bus.publish(EngineEvent::ExecutionFinished {
                execution_id,
                status: existing.status,
            });
            return existing.status;
        }
    }

    if let Err(e) = inner
        .repo
        .update_execution_status(&execution_id, outcome.status, outcome.error.as_deref())
        .await
    {
        tracing::error!(
            execution_id = %execution_id,
            error = %e,
            "failed to persist final execution status"
        );
    }

    match outcome.status {
        ExecutionStatus::Failed => tracing::warn!(
            execution_id = %execution_id,
            error = outcome.error.as_deref().unwrap_or_default(),
            "execution failed"
        ),
        status => tracing::info!(execution_id = %execution_id, status = %status, "execution finished"),
    }

    if inner.settings.prune_checkpoints && outcome.status.is_terminal() {
        if let Err(e) = inner.checkpoints.prune(execution_id).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "checkpoint pruning failed");
        }
    }

    inner.event_bus.publish(EngineEvent::ExecutionFinished {
        execution_id,
        status: outcome.status,
    });
    outcome.status
}

async fn watch_external_cancel<R: WorkflowRepository>(
    repo: R,
    execution_id: Uuid,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(EXTERNAL_CANCEL_POLL) => {}
        }
        if let Ok(Some(execution)) = repo.get_execution(&execution_id).await {
            if execution.status == ExecutionStatus::Cancelled {
                tracing::info!(execution_id = %execution_id, "execution cancelled externally");
                cancel.cancel();
                return;
            }
        }
    }
}
