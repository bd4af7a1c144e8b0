//! Infrastructure layer for Taskloom.
//!
//! Contains implementations of the ports defined in `taskloom-core`: SQLite
//! persistence, configuration loading, and the built-in `echo` and `http`
//! capabilities.

pub mod capability;
pub mod config;
pub mod sqlite;
