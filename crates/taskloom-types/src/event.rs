//! Event types for the Taskloom engine event bus.
//!
//! `EngineEvent` records task dispatch, retry, and circuit-breaker activity.
//! Events are appended to the owning execution's context and broadcast to
//! live subscribers. They are never checkpointed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Circuit breaker state, as reported in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Events emitted while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        version: u32,
        /// True when resuming from a checkpoint.
        resumed: bool,
    },

    TaskStarted {
        execution_id: Uuid,
        task_id: String,
        action: String,
        attempt: u32,
    },

    TaskSucceeded {
        execution_id: Uuid,
        task_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    TaskFailed {
        execution_id: Uuid,
        task_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },

    RetryScheduled {
        execution_id: Uuid,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    TaskSkipped {
        execution_id: Uuid,
        task_id: String,
        reason: String,
    },

    CircuitTransition {
        execution_id: Uuid,
        action: String,
        from: CircuitState,
        to: CircuitState,
    },

    CircuitRejected {
        execution_id: Uuid,
        task_id: String,
        action: String,
    },

    CheckpointWritten {
        execution_id: Uuid,
        index: u64,
        task_id: String,
    },

    ExecutionFinished {
        execution_id: Uuid,
        status: crate::execution::ExecutionStatus,
    },
}

impl EngineEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::TaskStarted { execution_id, .. }
            | Self::TaskSucceeded { execution_id, .. }
            | Self::TaskFailed { execution_id, .. }
            | Self::RetryScheduled { execution_id, .. }
            | Self::TaskSkipped { execution_id, .. }
            | Self::CircuitTransition { execution_id, .. }
            | Self::CircuitRejected { execution_id, .. }
            | Self::CheckpointWritten { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}
