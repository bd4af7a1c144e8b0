//! Execution scheduler: drives one execution's task graph to a terminal state.
//!
//! The scheduler keeps a ready set of tasks whose predecessors are satisfied,
//! dispatches them concurrently through the [`RetryCoordinator`] (bounded by
//! the concurrency limit and by `parallel_group`), and folds each completion
//! into the [`OrchestrationContext`] before appending a checkpoint. Checkpoint
//! appends happen only on the scheduler loop, one at a time.
//!
//! Ready tasks are always considered in ascending topological depth, then
//! declaration order, so dispatch order is reproducible for identical inputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskloom_types::config::SchedulerSettings;
use taskloom_types::event::EngineEvent;
use taskloom_types::execution::{CheckpointKind, ExecutionStatus, TaskResult, TaskStatus};
use taskloom_types::workflow::WorkflowDefinition;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{CheckpointMarker, OrchestrationContext};
use super::graph::DependencyGraph;
use super::retry::{
    BackoffPolicy, DispatchError, DispatchOutcome, DispatchRequest, RetryCoordinator, task_timeout,
};
use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error / outcome types
// ---------------------------------------------------------------------------

/// Failures that stop the scheduler itself (as opposed to task failures).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Terminal status reached by a run, with the reason for a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// Per-run scheduling options, resolved from engine settings and workflow config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub max_concurrency: usize,
    pub fail_fast: bool,
    pub skipped_satisfies_dependencies: bool,
}

impl RunOptions {
    pub fn resolve(settings: &SchedulerSettings, definition: &WorkflowDefinition) -> Self {
        Self {
            max_concurrency: definition
                .config
                .max_concurrency
                .unwrap_or(settings.max_concurrency)
                .max(1),
            fail_fast: definition.config.fail_fast,
            skipped_satisfies_dependencies: definition.config.skipped_satisfies_dependencies,
        }
    }
}

/// Whether a pending task can run now.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Ready,
    Wait,
    Skip(String),
}

/// How a predecessor's outcome affects its dependents.
enum DependencyState {
    Satisfied,
    Wait,
    Blocked(String),
}

type Joined = (String, DateTime<Utc>, DispatchOutcome);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs executions. One scheduler serves any number of concurrent
/// executions; all per-run state lives in the context passed to [`run`](Self::run).
pub struct Scheduler<R: WorkflowRepository> {
    checkpoints: Arc<CheckpointManager<R>>,
    coordinator: RetryCoordinator,
    event_bus: EventBus,
    settings: SchedulerSettings,
}

impl<R: WorkflowRepository> Scheduler<R> {
    pub fn new(
        checkpoints: Arc<CheckpointManager<R>>,
        coordinator: RetryCoordinator,
        event_bus: EventBus,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            checkpoints,
            coordinator,
            event_bus,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Drive an execution until every task is decided, fail-fast aborts it,
    /// or it is cancelled.
    ///
    /// `ctx` may already hold results restored from a checkpoint; those tasks
    /// are not dispatched again. Returns `Err` only when progress cannot be
    /// written, in which case the caller must fail the execution. Dispatches
    /// still in flight at that point are aborted before this returns.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        ctx: &mut OrchestrationContext,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, SchedulerError> {
        let mut join_set: JoinSet<Joined> = JoinSet::new();
        let result = self
            .drive(definition, graph, ctx, cancel, &mut join_set)
            .await;
        if result.is_err() && !join_set.is_empty() {
            tracing::warn!(
                execution_id = %ctx.execution_id(),
                in_flight = join_set.len(),
                "aborting in-flight tasks after write failure"
            );
            join_set.shutdown().await;
        }
        result
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        ctx: &mut OrchestrationContext,
        cancel: CancellationToken,
        join_set: &mut JoinSet<Joined>,
    ) -> Result<RunOutcome, SchedulerError> {
        let options = RunOptions::resolve(&self.settings, definition);
        let limit = options.max_concurrency;
        let order: Vec<String> = graph.dispatch_order().into_iter().map(str::to_string).collect();
        let execution_id = ctx.execution_id();

        tracing::info!(
            execution_id = %execution_id,
            tasks = graph.len(),
            widest_level = graph.max_width(),
            restored = ctx.completed_count(),
            limit,
            "scheduler started"
        );

        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut busy_groups: HashSet<String> = HashSet::new();
        let mut abort_reason: Option<String> = None;
        let mut cancelled = cancel.is_cancelled();

        loop {
            if !cancelled && abort_reason.is_none() {
                self.settle(&order, definition, graph, &options, ctx).await?;
                abort_reason = self.unrecoverable_failure(graph, ctx, &options);
            }

            if !cancelled && abort_reason.is_none() {
                for task_id in &order {
                    if ctx.running_count() >= limit {
                        break;
                    }
                    if ctx.status_of(task_id) != TaskStatus::Pending {
                        continue;
                    }
                    let Some(task) = definition.task(task_id) else {
                        continue;
                    };
                    if let Some(group) = &task.parallel_group {
                        if busy_groups.contains(group) {
                            continue;
                        }
                    }
                    if readiness(task_id, definition, graph, &options, ctx) != Readiness::Ready {
                        continue;
                    }

                    let started_at = Utc::now();
                    self.checkpoints
                        .log_transition(execution_id, &TaskResult::running(task_id, started_at))
                        .await?;
                    ctx.mark_running(task_id);

                    let request = DispatchRequest {
                        execution_id,
                        task_id: task_id.clone(),
                        action: task.action.clone(),
                        parameters: task.parameters.clone(),
                        policy: BackoffPolicy::resolve(&self.settings, &definition.config, task),
                        timeout: task_timeout(&self.settings, &definition.config, task),
                    };
                    let coordinator = self.coordinator.clone();
                    let token = cancel.clone();
                    let id = task_id.clone();
                    let handle = join_set.spawn(async move {
                        let outcome = coordinator.dispatch(request, token).await;
                        (id, started_at, outcome)
                    });

                    tracing::debug!(
                        execution_id = %execution_id,
                        task_id = task_id.as_str(),
                        running = ctx.running_count(),
                        "task dispatched"
                    );
                    in_flight.insert(handle.id(), task_id.clone());
                    if let Some(group) = &task.parallel_group {
                        busy_groups.insert(group.clone());
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    tracing::info!(
                        execution_id = %execution_id,
                        in_flight = ctx.running_count(),
                        "cancellation requested, draining in-flight tasks"
                    );
                    cancelled = true;
                    continue;
                }
                joined = join_set.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                continue;
            };

            let (task_id, result) = match joined {
                Ok((id, (task_id, started_at, outcome))) => {
                    in_flight.remove(&id);
                    (task_id, Ok((started_at, outcome)))
                }
                Err(join_error) => {
                    let task_id = in_flight.remove(&join_error.id()).unwrap_or_default();
                    (task_id, Err(join_error.to_string()))
                }
            };
            if let Some(group) = definition
                .task(&task_id)
                .and_then(|t| t.parallel_group.as_ref())
            {
                busy_groups.remove(group);
            }

            let result = match result {
                Ok((started_at, outcome)) => {
                    let action = definition
                        .task(&task_id)
                        .map(|t| t.action.as_str())
                        .unwrap_or_default();
                    let stats = ctx.action_stats_mut(action);
                    stats.invocations += outcome.stats.invocations;
                    stats.successes += outcome.stats.successes;
                    stats.transient_failures += outcome.stats.transient_failures;
                    stats.permanent_failures += outcome.stats.permanent_failures;
                    stats.rejections += outcome.stats.rejections;
                    for event in outcome.events {
                        ctx.push_event(event);
                    }

                    match outcome.result {
                        Ok(output) => {
                            TaskResult::succeeded(&task_id, outcome.attempts, output, started_at)
                        }
                        // Interrupted during backoff; stays pending.
                        Err(DispatchError::Cancelled) => {
                            ctx.clear_running(&task_id);
                            self.checkpoints
                                .log_transition(execution_id, &TaskResult::pending(&task_id))
                                .await?;
                            continue;
                        }
                        Err(error) => TaskResult::failed(
                            &task_id,
                            outcome.attempts,
                            error.to_string(),
                            started_at,
                        ),
                    }
                }
                Err(panic) => {
                    tracing::error!(
                        execution_id = %execution_id,
                        task_id = task_id.as_str(),
                        error = %panic,
                        "task dispatch panicked"
                    );
                    TaskResult::failed(&task_id, 1, format!("task panicked: {panic}"), Utc::now())
                }
            };

            self.complete(graph, ctx, result).await?;
        }

        let outcome = if cancelled {
            let checkpoint = self
                .checkpoints
                .record_cancelled(execution_id, ctx.last_task_id(), ctx.snapshot())
                .await?;
            self.note_checkpoint(ctx, checkpoint.index, checkpoint.task_id, CheckpointKind::Cancelled);
            RunOutcome {
                status: ExecutionStatus::Cancelled,
                error: None,
            }
        } else if let Some(reason) = abort_reason {
            self.skip_remaining(&order, ctx, &format!("execution aborted: {reason}"))
                .await?;
            RunOutcome {
                status: ExecutionStatus::Failed,
                error: Some(reason),
            }
        } else if order.iter().any(|id| ctx.status_of(id) == TaskStatus::Pending) {
            self.skip_remaining(&order, ctx, "unreachable").await?;
            RunOutcome {
                status: ExecutionStatus::Failed,
                error: Some("no remaining tasks are reachable".to_string()),
            }
        } else {
            RunOutcome {
                status: ExecutionStatus::Completed,
                error: None,
            }
        };

        tracing::info!(
            execution_id = %execution_id,
            status = %outcome.status,
            "scheduler finished"
        );
        Ok(outcome)
    }

    /// Record every decision that needs no dispatch (skips), repeating until
    /// nothing changes, so skips cascade through descendants.
    async fn settle(
        &self,
        order: &[String],
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        options: &RunOptions,
        ctx: &mut OrchestrationContext,
    ) -> Result<(), SchedulerError> {
        loop {
            let mut changed = false;
            for task_id in order {
                if ctx.status_of(task_id) != TaskStatus::Pending {
                    continue;
                }
                if let Readiness::Skip(reason) = readiness(task_id, definition, graph, options, ctx) {
                    self.skip(ctx, task_id, reason).await?;
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// A failure that cannot be recovered, if fail-fast should act on it.
    fn unrecoverable_failure(
        &self,
        graph: &DependencyGraph,
        ctx: &OrchestrationContext,
        options: &RunOptions,
    ) -> Option<String> {
        if !options.fail_fast {
            return None;
        }
        ctx.results()
            .filter(|r| r.status == TaskStatus::Failed && r.recovered_by.is_none())
            .find(|r| {
                let fallback = graph.node(&r.task_id).and_then(|n| n.fallback.as_deref());
                match fallback {
                    None => true,
                    Some(f) => matches!(ctx.status_of(f), TaskStatus::Failed | TaskStatus::Skipped),
                }
            })
            .map(|r| {
                format!(
                    "task '{}' failed: {}",
                    r.task_id,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
    }

    async fn skip(
        &self,
        ctx: &mut OrchestrationContext,
        task_id: &str,
        reason: String,
    ) -> Result<(), SchedulerError> {
        tracing::info!(
            execution_id = %ctx.execution_id(),
            task_id,
            reason = reason.as_str(),
            "task skipped"
        );
        let event = EngineEvent::TaskSkipped {
            execution_id: ctx.execution_id(),
            task_id: task_id.to_string(),
            reason: reason.clone(),
        };
        self.event_bus.publish(event.clone());
        ctx.push_event(event);

        let result = TaskResult::skipped(task_id, reason);
        ctx.record_result(result.clone());
        let checkpoint = self
            .checkpoints
            .record(ctx.execution_id(), task_id, ctx.snapshot(), &[result])
            .await?;
        self.note_checkpoint(ctx, checkpoint.index, checkpoint.task_id, CheckpointKind::Task);
        Ok(())
    }

    async fn skip_remaining(
        &self,
        order: &[String],
        ctx: &mut OrchestrationContext,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        for task_id in order {
            if ctx.status_of(task_id) == TaskStatus::Pending {
                self.skip(ctx, task_id, reason.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Fold a dispatched task's terminal result into the context and
    /// checkpoint it. A succeeding fallback also marks its owner recovered.
    async fn complete(
        &self,
        graph: &DependencyGraph,
        ctx: &mut OrchestrationContext,
        result: TaskResult,
    ) -> Result<(), SchedulerError> {
        let task_id = result.task_id.clone();
        let succeeded = result.status == TaskStatus::Succeeded;
        ctx.record_result(result.clone());

        let mut log = vec![result];
        if succeeded {
            if let Some(owner) = graph.node(&task_id).and_then(|n| n.fallback_for.as_deref()) {
                if let Some(recovered) = ctx.mark_recovered(owner, &task_id).cloned() {
                    tracing::info!(
                        execution_id = %ctx.execution_id(),
                        task_id = owner,
                        fallback = task_id.as_str(),
                        "task recovered by fallback"
                    );
                    log.push(recovered);
                }
            }
        }

        let checkpoint = self
            .checkpoints
            .record(ctx.execution_id(), &task_id, ctx.snapshot(), &log)
            .await?;
        self.note_checkpoint(ctx, checkpoint.index, checkpoint.task_id, CheckpointKind::Task);
        Ok(())
    }

    fn note_checkpoint(
        &self,
        ctx: &mut OrchestrationContext,
        index: u64,
        task_id: String,
        kind: CheckpointKind,
    ) {
        let event = EngineEvent::CheckpointWritten {
            execution_id: ctx.execution_id(),
            index,
            task_id: task_id.clone(),
        };
        self.event_bus.publish(event.clone());
        ctx.push_event(event);
        ctx.push_checkpoint(CheckpointMarker {
            index,
            task_id,
            kind,
        });
    }
}

fn dependency_state(
    pred: &str,
    graph: &DependencyGraph,
    options: &RunOptions,
    ctx: &OrchestrationContext,
) -> DependencyState {
    match ctx.status_of(pred) {
        TaskStatus::Succeeded => DependencyState::Satisfied,
        TaskStatus::Pending | TaskStatus::Running => DependencyState::Wait,
        TaskStatus::Skipped if options.skipped_satisfies_dependencies => DependencyState::Satisfied,
        TaskStatus::Skipped => DependencyState::Blocked(format!("dependency '{pred}' was skipped")),
        TaskStatus::Failed => {
            match graph.node(pred).and_then(|n| n.fallback.as_deref()) {
                None => DependencyState::Blocked(format!("dependency '{pred}' failed")),
                Some(fallback) => match ctx.status_of(fallback) {
                    TaskStatus::Succeeded => DependencyState::Satisfied,
                    TaskStatus::Pending | TaskStatus::Running => DependencyState::Wait,
                    TaskStatus::Failed | TaskStatus::Skipped => DependencyState::Blocked(format!(
                        "dependency '{pred}' failed and fallback '{fallback}' did not recover it"
                    )),
                },
            }
        }
    }
}

fn readiness(
    task_id: &str,
    definition: &WorkflowDefinition,
    graph: &DependencyGraph,
    options: &RunOptions,
    ctx: &OrchestrationContext,
) -> Readiness {
    let Some(node) = graph.node(task_id) else {
        return Readiness::Wait;
    };

    if let Some(owner) = &node.fallback_for {
        match ctx.status_of(owner) {
            TaskStatus::Pending | TaskStatus::Running => return Readiness::Wait,
            TaskStatus::Succeeded | TaskStatus::Skipped => {
                return Readiness::Skip(format!("fallback not needed: '{owner}' did not fail"));
            }
            TaskStatus::Failed => {}
        }
    }

    let mut blocked: Option<String> = None;
    for pred in &node.predecessors {
        match dependency_state(pred, graph, options, ctx) {
            DependencyState::Satisfied => {}
            DependencyState::Wait => return Readiness::Wait,
            DependencyState::Blocked(reason) => {
                blocked.get_or_insert(reason);
            }
        }
    }

    match blocked {
        None => Readiness::Ready,
        Some(_) if definition.task(task_id).is_some_and(|t| t.run_on_failure) => {
            Readiness::Ready
        }
        Some(reason) => Readiness::Skip(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BoxCapability, CapabilityRegistry};
    use crate::repository::InMemoryWorkflowRepository;
    use crate::test_support::{FaultyRepository, StubCapability, set_param, stub_workflow};
    use crate::workflow::breaker::BreakerRegistry;
    use serde_json::{Map, Value, json};
    use taskloom_types::config::BreakerSettings;
    use taskloom_types::execution::Execution;
    use taskloom_types::workflow::RetryPolicy;
    use uuid::Uuid;

    fn scheduler<R: WorkflowRepository>(repo: R, stub: &StubCapability) -> Scheduler<R> {
        let registry = CapabilityRegistry::new().with("stub", BoxCapability::new(stub.clone()));
        let bus = EventBus::new(256);
        let coordinator = RetryCoordinator::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::new(BreakerSettings {
                failure_threshold: 1_000,
                ..Default::default()
            })),
            bus.clone(),
        );
        Scheduler::new(
            Arc::new(CheckpointManager::new(repo)),
            coordinator,
            bus,
            SchedulerSettings::default(),
        )
    }

    async fn start<R: WorkflowRepository>(repo: &R) -> OrchestrationContext {
        let exec = Execution::new(Uuid::now_v7(), 1, Map::new());
        repo.create_execution(&exec).await.unwrap();
        OrchestrationContext::new(exec.id, exec.workflow_id, Map::new())
    }

    async fn run_def(
        def: &WorkflowDefinition,
        stub: &StubCapability,
    ) -> (RunOutcome, OrchestrationContext, InMemoryWorkflowRepository) {
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), stub);
        let graph = DependencyGraph::resolve(def).unwrap();
        let mut ctx = start(&repo).await;
        let outcome = sched
            .run(def, &graph, &mut ctx, CancellationToken::new())
            .await
            .unwrap();
        (outcome, ctx, repo)
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_roots_run_concurrently_before_join() {
        let mut def = stub_workflow("diamond", &[("a", &[]), ("b", &[]), ("c", &["a", "b"])]);
        set_param(&mut def, "a", "delay_ms", json!(100));
        set_param(&mut def, "b", "delay_ms", json!(100));
        let stub = StubCapability::new();

        let (outcome, ctx, _) = run_def(&def, &stub).await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(stub.peak(), 2);
        assert_eq!(stub.started().last().map(String::as_str), Some("c"));
        assert_eq!(ctx.status_of("c"), TaskStatus::Succeeded);
        assert!(ctx.task_output("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_dependents_without_fail_fast() {
        let mut def = stub_workflow("partial", &[("a", &[]), ("b", &["a"])]);
        def.config.fail_fast = false;
        set_param(&mut def, "a", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (outcome, ctx, _) = run_def(&def, &stub).await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(ctx.status_of("a"), TaskStatus::Failed);
        assert_eq!(ctx.status_of("b"), TaskStatus::Skipped);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_aborts_pending_work() {
        let mut def = stub_workflow("strict", &[("a", &[]), ("b", &[]), ("c", &["b"])]);
        def.config.max_concurrency = Some(1);
        set_param(&mut def, "a", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (outcome, ctx, _) = run_def(&def, &stub).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.unwrap().contains("task 'a' failed"));
        assert_eq!(ctx.status_of("b"), TaskStatus::Skipped);
        assert_eq!(ctx.status_of("c"), TaskStatus::Skipped);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_to_success() {
        let mut def = stub_workflow("flaky", &[("a", &[])]);
        set_param(&mut def, "a", "fail_times", json!(2));
        let stub = StubCapability::new();

        let (outcome, ctx, _) = run_def(&def, &stub).await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(ctx.result("a").unwrap().attempt_count, 3);
        assert_eq!(ctx.action_stats()["stub"].transient_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_recovers_owner() {
        let mut def = stub_workflow("fallback", &[("a", &[]), ("rescue", &[]), ("c", &["a"])]);
        def.tasks.get_mut("a").unwrap().fallback = Some("rescue".into());
        set_param(&mut def, "a", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (outcome, ctx, repo) = run_def(&def, &stub).await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        let a = ctx.result("a").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.recovered_by.as_deref(), Some("rescue"));
        assert_eq!(ctx.status_of("rescue"), TaskStatus::Succeeded);
        assert_eq!(ctx.status_of("c"), TaskStatus::Succeeded);

        let stored = repo.get_execution(&ctx.execution_id()).await.unwrap().unwrap();
        assert_eq!(
            stored.result("a").unwrap().recovered_by.as_deref(),
            Some("rescue")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_fallback_is_skipped() {
        let mut def = stub_workflow("fallback", &[("a", &[]), ("rescue", &[]), ("after", &["rescue"])]);
        def.tasks.get_mut("a").unwrap().fallback = Some("rescue".into());
        let stub = StubCapability::new();

        let (outcome, ctx, _) = run_def(&def, &stub).await;
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(ctx.status_of("rescue"), TaskStatus::Skipped);
        assert_eq!(ctx.status_of("after"), TaskStatus::Skipped);

        def.config.skipped_satisfies_dependencies = true;
        let (_, ctx, _) = run_def(&def, &StubCapability::new()).await;
        assert_eq!(ctx.status_of("after"), TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_failure_task_still_runs() {
        let mut def = stub_workflow("cleanup", &[("a", &[]), ("b", &["a"]), ("cleanup", &["b"])]);
        def.config.fail_fast = false;
        def.tasks.get_mut("cleanup").unwrap().run_on_failure = true;
        set_param(&mut def, "a", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (_, ctx, _) = run_def(&def, &stub).await;
        assert_eq!(ctx.status_of("b"), TaskStatus::Skipped);
        assert_eq!(ctx.status_of("cleanup"), TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_is_respected() {
        let ids = ["t1", "t2", "t3", "t4", "t5", "t6"];
        let tasks: Vec<(&str, &[&str])> = ids.iter().map(|id| (*id, &[][..])).collect();
        let mut def = stub_workflow("wide", &tasks);
        def.config.max_concurrency = Some(2);
        for id in ids {
            set_param(&mut def, id, "delay_ms", json!(50));
        }
        let stub = StubCapability::new();

        let (outcome, _, _) = run_def(&def, &stub).await;
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(stub.peak(), 2);
        assert_eq!(stub.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_set_spans_depth_levels() {
        // Once `b` finishes, `c` and `e` (depth 1) run alongside the slow root `a`.
        let mut def = stub_workflow(
            "staggered",
            &[("a", &[]), ("b", &[]), ("c", &["b"]), ("e", &["b"])],
        );
        set_param(&mut def, "a", "delay_ms", json!(1_000));
        set_param(&mut def, "b", "delay_ms", json!(10));
        set_param(&mut def, "c", "delay_ms", json!(100));
        set_param(&mut def, "e", "delay_ms", json!(100));
        let stub = StubCapability::new();

        let (outcome, _, _) = run_def(&def, &stub).await;
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(stub.peak(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_failed_results_carry_an_error() {
        let mut def = stub_workflow("partial", &[("a", &[]), ("b", &["a"]), ("c", &[])]);
        def.config.fail_fast = false;
        set_param(&mut def, "a", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (_, ctx, repo) = run_def(&def, &stub).await;
        let b = ctx.result("b").unwrap();
        assert_eq!(b.status, TaskStatus::Skipped);
        assert_eq!(b.skip_reason.as_deref(), Some("dependency 'a' failed"));

        let stored = repo.get_execution(&ctx.execution_id()).await.unwrap().unwrap();
        for result in ctx.results().chain(stored.results.iter()) {
            if result.status == TaskStatus::Failed {
                assert!(result.error.is_some());
            } else {
                assert!(result.error.is_none(), "'{}' is {}", result.task_id, result.status);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatched_task_is_recorded_running() {
        let mut def = stub_workflow("slow", &[("a", &[])]);
        set_param(&mut def, "a", "delay_ms", json!(100));
        let stub = StubCapability::new();
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), &stub);
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;
        let id = ctx.execution_id();

        let (outcome, observed) = tokio::join!(
            sched.run(&def, &graph, &mut ctx, CancellationToken::new()),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                repo.get_execution(&id).await.unwrap().unwrap()
            }
        );
        assert_eq!(outcome.unwrap().status, ExecutionStatus::Completed);
        let during = observed.result("a").unwrap();
        assert_eq!(during.status, TaskStatus::Running);
        assert!(during.started_at.is_some());

        let log: Vec<TaskStatus> = repo
            .list_task_results(&id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(log, vec![TaskStatus::Running, TaskStatus::Succeeded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_backoff_returns_task_to_pending() {
        let mut def = stub_workflow("flaky", &[("a", &[])]);
        set_param(&mut def, "a", "fail", json!("transient"));
        def.tasks.get_mut("a").unwrap().retry_policy = Some(RetryPolicy {
            max_retries: Some(5),
            base_delay_ms: Some(60_000),
            max_delay_ms: Some(60_000),
        });
        let stub = StubCapability::new();
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), &stub);
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = sched.run(&def, &graph, &mut ctx, cancel).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(ctx.status_of("a"), TaskStatus::Pending);
        let stored = repo.get_execution(&ctx.execution_id()).await.unwrap().unwrap();
        assert_eq!(stored.result("a").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_group_serializes_members() {
        let mut def = stub_workflow("grouped", &[("a", &[]), ("b", &[]), ("c", &[])]);
        for id in ["a", "b", "c"] {
            def.tasks.get_mut(id).unwrap().parallel_group = Some("db".into());
            set_param(&mut def, id, "delay_ms", json!(20));
        }
        let stub = StubCapability::new();

        run_def(&def, &stub).await;
        assert_eq!(stub.peak(), 1);
        assert_eq!(stub.started(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_is_depth_then_declaration() {
        let mut def = stub_workflow(
            "ordered",
            &[("late", &["b"]), ("b", &[]), ("a", &[]), ("z", &["a"])],
        );
        def.config.max_concurrency = Some(1);
        let stub = StubCapability::new();

        run_def(&def, &stub).await;
        assert_eq!(stub.started(), vec!["b", "a", "late", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_terminal_task_is_checkpointed() {
        let mut def = stub_workflow("chain", &[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        def.config.fail_fast = false;
        set_param(&mut def, "b", "fail", json!("permanent"));
        let stub = StubCapability::new();

        let (_, ctx, repo) = run_def(&def, &stub).await;
        let checkpoints = repo.list_checkpoints(&ctx.execution_id()).await.unwrap();
        let tasks: Vec<&str> = checkpoints.iter().map(|c| c.task_id.as_str()).collect();
        assert_eq!(tasks, vec!["a", "b", "c"]);
        assert_eq!(
            checkpoints.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(checkpoints[2].snapshot.results.len(), 3);
        assert_eq!(ctx.checkpoints().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_failure_is_fatal() {
        let def = stub_workflow("chain", &[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let repo = FaultyRepository::new(InMemoryWorkflowRepository::new(), 1);
        let stub = StubCapability::new();
        let sched = scheduler(repo.clone(), &stub);
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;

        let err = sched
            .run(&def, &graph, &mut ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Checkpoint(_)));
        assert_eq!(stub.calls(), 2);
        let durable = repo.inner().list_checkpoints(&ctx.execution_id()).await.unwrap();
        assert_eq!(durable.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_in_flight_and_stops() {
        let mut def = stub_workflow("slow", &[("a", &[]), ("b", &["a"])]);
        set_param(&mut def, "a", "delay_ms", json!(1_000));
        let stub = StubCapability::new();
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), &stub);
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = sched.run(&def, &graph, &mut ctx, cancel).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(ctx.status_of("a"), TaskStatus::Succeeded);
        assert_eq!(ctx.status_of("b"), TaskStatus::Pending);
        assert_eq!(stub.calls(), 1);

        let last = repo.latest_checkpoint(&ctx.execution_id()).await.unwrap().unwrap();
        assert_eq!(last.kind, CheckpointKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_tasks_are_not_redispatched() {
        let def = stub_workflow("resume", &[("a", &[]), ("b", &["a"])]);
        let stub = StubCapability::new();
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), &stub);
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;
        ctx.record_result(TaskResult::succeeded("a", 1, Value::from("cached"), Utc::now()));

        let outcome = sched
            .run(&def, &graph, &mut ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(stub.started(), vec!["b"]);
        assert_eq!(ctx.task_output("a"), Some(&Value::from("cached")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_broadcast() {
        let def = stub_workflow("events", &[("a", &[])]);
        let stub = StubCapability::new();
        let repo = InMemoryWorkflowRepository::new();
        let sched = scheduler(repo.clone(), &stub);
        let mut rx = sched.event_bus.subscribe();
        let graph = DependencyGraph::resolve(&def).unwrap();
        let mut ctx = start(&repo).await;

        sched
            .run(&def, &graph, &mut ctx, CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(e, EngineEvent::TaskSucceeded { .. })));
        assert!(seen.iter().any(|e| matches!(e, EngineEvent::CheckpointWritten { index: 0, .. })));
        assert_eq!(seen.len(), ctx.events().len());
    }
}
