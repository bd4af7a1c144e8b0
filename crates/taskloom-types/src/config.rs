//! Engine configuration types for Taskloom.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! scheduler concurrency, retry defaults, circuit-breaker thresholds, and
//! checkpoint retention.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the orchestration engine.
///
/// Loaded from `~/.taskloom/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overrides the default `sqlite://<data_dir>/taskloom.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub engine: SchedulerSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// Scheduler and retry defaults, applied when a workflow does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Drop all but the latest checkpoint once an execution is terminal.
    #[serde(default = "default_prune_checkpoints")]
    pub prune_checkpoints: bool,
    /// Capacity of the broadcast channel for engine events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrency() -> usize {
    20
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_prune_checkpoints() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_task_timeout_secs: default_task_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            prune_checkpoints: default_prune_checkpoints(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Circuit breaker thresholds, shared by every action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Transient failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How long the circuit stays open before allowing a trial call.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}
