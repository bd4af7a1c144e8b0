//! BoxCapability -- object-safe dynamic dispatch wrapper for Capability.
//!
//! 1. Define an object-safe `CapabilityDyn` trait with boxed futures
//! 2. Blanket-impl `CapabilityDyn` for all `T: Capability`
//! 3. `BoxCapability` wraps `Box<dyn CapabilityDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use taskloom_types::error::CapabilityError;

use super::handler::Capability;

/// Object-safe version of [`Capability`] with boxed futures.
pub trait CapabilityDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>>;
}

impl<T: Capability> CapabilityDyn for T {
    fn name(&self) -> &str {
        Capability::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(action, parameters))
    }
}

/// Type-erased capability for runtime registration.
///
/// `Capability` uses RPITIT and cannot be a trait object directly, so the
/// registry stores handlers as `BoxCapability`.
pub struct BoxCapability {
    inner: Box<dyn CapabilityDyn>,
}

impl BoxCapability {
    pub fn new<T: Capability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        self.inner.invoke_boxed(action, parameters).await
    }
}

impl std::fmt::Debug for BoxCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapability")
            .field("name", &self.name())
            .finish()
    }
}
