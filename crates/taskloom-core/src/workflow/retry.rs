//! Retry coordinator: bounded retries with exponential backoff, guarded by
//! the per-action circuit breakers.
//!
//! Every task dispatch goes through [`RetryCoordinator::dispatch`]. It returns
//! the final outcome together with the events and counters produced along
//! the way; the scheduler folds those into the execution's context.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use taskloom_types::config::SchedulerSettings;
use taskloom_types::error::{CapabilityError, CircuitOpenError};
use taskloom_types::event::EngineEvent;
use taskloom_types::workflow::{TaskDefinition, WorkflowConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breaker::{Admission, BreakerRegistry, Transition};
use super::context::ActionStats;
use crate::capability::CapabilityRegistry;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Effective retry settings for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Task override, then workflow config, then engine defaults.
    pub fn resolve(
        settings: &SchedulerSettings,
        config: &WorkflowConfig,
        task: &TaskDefinition,
    ) -> Self {
        let task_policy = task.retry_policy.as_ref();
        let max_retries = task_policy
            .and_then(|p| p.max_retries)
            .or(config.max_retries)
            .unwrap_or(settings.max_retries);
        let base_ms = task_policy
            .and_then(|p| p.base_delay_ms)
            .or(config.base_delay_ms)
            .unwrap_or(settings.base_delay_ms);
        let max_ms = task_policy
            .and_then(|p| p.max_delay_ms)
            .or(config.max_delay_ms)
            .unwrap_or(settings.max_delay_ms);
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the retry that follows attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a failed attempt should be retried.
    pub fn should_retry(&self, attempt: u32, error: &DispatchError) -> bool {
        error.is_transient() && attempt < self.max_attempts()
    }
}

/// Effective timeout for one task.
pub fn task_timeout(
    settings: &SchedulerSettings,
    config: &WorkflowConfig,
    task: &TaskDefinition,
) -> Duration {
    Duration::from_secs(
        task.timeout_secs
            .or(config.timeout_secs)
            .unwrap_or(settings.default_task_timeout_secs),
    )
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Why a dispatch did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Transient errors and timeouts are retry-eligible.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Capability(e) => e.is_transient(),
            Self::Timeout(_) => true,
            Self::CircuitOpen(_) | Self::Cancelled => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TrialSlot
// ---------------------------------------------------------------------------

/// Holds a half-open trial admission until its outcome is recorded. Dropped
/// while still held (the dispatch future was aborted), it hands the slot back
/// so the breaker does not stay half-open with a trial nobody will finish.
struct TrialSlot<'a> {
    breakers: &'a BreakerRegistry,
    action: &'a str,
    held: bool,
}

impl<'a> TrialSlot<'a> {
    fn new(breakers: &'a BreakerRegistry, action: &'a str, admission: Admission) -> Self {
        Self {
            breakers,
            action,
            held: admission == Admission::Trial,
        }
    }

    fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            tracing::debug!(action = self.action, "releasing abandoned half-open trial");
            self.breakers.release_trial(self.action);
        }
    }
}

// ---------------------------------------------------------------------------
// RetryCoordinator
// ---------------------------------------------------------------------------

/// One task dispatch request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub execution_id: Uuid,
    pub task_id: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub policy: BackoffPolicy,
    pub timeout: Duration,
}

/// Result of a dispatch, including the attempts it took.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Capability invocations actually made.
    pub attempts: u32,
    pub result: Result<Value, DispatchError>,
    pub events: Vec<EngineEvent>,
    pub stats: ActionStats,
}

/// Wraps capability invocation with retries and circuit breaking.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerRegistry>,
    event_bus: EventBus,
}

impl RetryCoordinator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        breakers: Arc<BreakerRegistry>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            breakers,
            event_bus,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Dispatch one task until it succeeds, fails permanently, runs out of
    /// retries, is rejected by an open circuit, or is cancelled during backoff.
    ///
    /// An in-flight invocation is never interrupted by cancellation; only
    /// further retries are suppressed.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            attempts: 0,
            result: Err(DispatchError::Cancelled),
            events: Vec::new(),
            stats: ActionStats::default(),
        };
        let execution_id = request.execution_id;

        loop {
            let admission = match self.breakers.acquire(&request.action) {
                Ok((admission, transition)) => {
                    self.note_transition(&mut outcome, execution_id, &request.action, transition);
                    admission
                }
                Err(open) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        task_id = %request.task_id,
                        action = %request.action,
                        "circuit open, rejecting dispatch"
                    );
                    outcome.stats.rejections += 1;
                    self.emit(
                        &mut outcome,
                        EngineEvent::CircuitRejected {
                            execution_id,
                            task_id: request.task_id.clone(),
                            action: request.action.clone(),
                        },
                    );
                    outcome.result = Err(DispatchError::CircuitOpen(open));
                    return outcome;
                }
            };

            let mut slot = TrialSlot::new(&self.breakers, &request.action, admission);
            outcome.attempts += 1;
            let attempt = outcome.attempts;
            outcome.stats.invocations += 1;
            self.emit(
                &mut outcome,
                EngineEvent::TaskStarted {
                    execution_id,
                    task_id: request.task_id.clone(),
                    action: request.action.clone(),
                    attempt,
                },
            );
            tracing::debug!(
                execution_id = %execution_id,
                task_id = %request.task_id,
                action = %request.action,
                attempt,
                "invoking capability"
            );

            let started = tokio::time::Instant::now();
            let result = match tokio::time::timeout(
                request.timeout,
                self.registry.invoke(&request.action, &request.parameters),
            )
            .await
            {
                Ok(inner) => inner.map_err(DispatchError::from),
                Err(_) => Err(DispatchError::Timeout(request.timeout)),
            };

            match result {
                Ok(output) => {
                    let transition = self.breakers.record(&request.action, admission, true);
                    slot.settle();
                    self.note_transition(&mut outcome, execution_id, &request.action, transition);
                    outcome.stats.successes += 1;
                    self.emit(
                        &mut outcome,
                        EngineEvent::TaskSucceeded {
                            execution_id,
                            task_id: request.task_id.clone(),
                            attempts: attempt,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    outcome.result = Ok(output);
                    return outcome;
                }
                Err(error) => {
                    let transient = error.is_transient();
                    let transition = self.breakers.record(&request.action, admission, !transient);
                    slot.settle();
                    self.note_transition(&mut outcome, execution_id, &request.action, transition);
                    if transient {
                        outcome.stats.transient_failures += 1;
                    } else {
                        outcome.stats.permanent_failures += 1;
                    }

                    let will_retry =
                        request.policy.should_retry(attempt, &error) && !cancel.is_cancelled();
                    tracing::warn!(
                        execution_id = %execution_id,
                        task_id = %request.task_id,
                        attempt,
                        will_retry,
                        error = %error,
                        "task attempt failed"
                    );
                    self.emit(
                        &mut outcome,
                        EngineEvent::TaskFailed {
                            execution_id,
                            task_id: request.task_id.clone(),
                            attempt,
                            error: error.to_string(),
                            will_retry,
                        },
                    );
                    if !will_retry {
                        outcome.result = Err(error);
                        return outcome;
                    }

                    let delay = request.policy.delay_for(attempt);
                    self.emit(
                        &mut outcome,
                        EngineEvent::RetryScheduled {
                            execution_id,
                            task_id: request.task_id.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            outcome.result = Err(DispatchError::Cancelled);
                            return outcome;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn emit(&self, outcome: &mut DispatchOutcome, event: EngineEvent) {
        self.event_bus.publish(event.clone());
        outcome.events.push(event);
    }

    fn note_transition(
        &self,
        outcome: &mut DispatchOutcome,
        execution_id: Uuid,
        action: &str,
        transition: Option<Transition>,
    ) {
        if let Some(t) = transition {
            tracing::info!(action, from = %t.from, to = %t.to, "circuit state changed");
            self.emit(
                outcome,
                EngineEvent::CircuitTransition {
                    execution_id,
                    action: action.to_string(),
                    from: t.from,
                    to: t.to,
                },
            );
        }
    }
}
