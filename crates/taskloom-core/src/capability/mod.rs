//! Capability abstraction and dispatch registry.
//!
//! A capability is an external collaborator that performs the work named by a
//! task's `action`. The engine only looks capabilities up by action name and
//! passes parameters and outputs through untouched.

pub mod box_capability;
pub mod handler;
pub mod registry;

pub use box_capability::BoxCapability;
pub use handler::Capability;
pub use registry::CapabilityRegistry;
