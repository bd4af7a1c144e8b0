//! Workflow engine core: graph resolution, scheduling, resilience, and durable state.
//!
//! - `definition` -- YAML parsing and validation
//! - `graph` -- dependency graph, cycle detection, depth levels
//! - `context` -- per-execution variables, results, events
//! - `breaker` -- per-action circuit breakers
//! - `retry` -- retry coordinator wrapping capability dispatch
//! - `checkpoint` -- durable checkpoint manager for crash recovery
//! - `scheduler` -- concurrent ready-set scheduler
//! - `version` -- append-only definition history
//! - `template` -- built-in starter definitions
//! - `engine` -- submission interface and background execution drivers

pub mod breaker;
pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod engine;
pub mod graph;
pub mod retry;
pub mod scheduler;
pub mod template;
pub mod version;
