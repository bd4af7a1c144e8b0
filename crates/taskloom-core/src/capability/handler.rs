//! Capability trait definition.

use serde_json::{Map, Value};
use taskloom_types::error::CapabilityError;

/// Trait for external task handlers (HTTP calls, file connectors, ...).
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). A single
/// implementation may serve several action names; the action is passed back
/// in on every call.
///
/// Implementations live in taskloom-infra (e.g., `HttpCapability`).
pub trait Capability: Send + Sync {
    /// Human-readable handler name used in logs.
    fn name(&self) -> &str;

    /// Perform `action` with the given opaque parameters.
    ///
    /// Errors must be tagged transient (retry-eligible) or permanent.
    fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<Value, CapabilityError>> + Send;
}
