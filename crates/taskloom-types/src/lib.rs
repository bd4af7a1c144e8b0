//! Shared domain types for Taskloom.
//!
//! This crate contains the domain types used across the orchestration engine:
//! workflow definitions, executions, task results, checkpoints, version
//! snapshots, engine events, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, indexmap, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
