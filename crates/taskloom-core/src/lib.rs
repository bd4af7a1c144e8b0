//! Orchestration logic and repository trait definitions for Taskloom.
//!
//! This crate defines the "ports" (repository and capability traits) that the
//! infrastructure layer implements. It depends only on `taskloom-types` --
//! never on `taskloom-infra` or any database/IO crate.

pub mod capability;
pub mod event;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
