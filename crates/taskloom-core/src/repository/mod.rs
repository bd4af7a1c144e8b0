//! Repository trait definitions (ports).
//!
//! The infrastructure layer (taskloom-infra) implements these with SQLite;
//! `memory` provides an in-process implementation for ephemeral runs and tests.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::WorkflowRepository;
