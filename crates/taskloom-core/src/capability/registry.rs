//! Capability registry for action-name lookup.
//!
//! An explicit, constructed mapping handed to the engine at startup. There is
//! no ambient global registration.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use taskloom_types::error::CapabilityError;

use super::box_capability::BoxCapability;

/// Registry of capabilities, indexed by action name.
///
/// One handler may be registered under several action names; the entries
/// share the handler through an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<BoxCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given action name.
    ///
    /// If a handler with this name already exists, it is replaced.
    pub fn register(&mut self, action: impl Into<String>, handler: BoxCapability) {
        self.handlers.insert(action.into(), Arc::new(handler));
    }

    /// Register one handler under several action names.
    pub fn register_many<I, S>(&mut self, actions: I, handler: BoxCapability)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handler = Arc::new(handler);
        for action in actions {
            self.handlers.insert(action.into(), Arc::clone(&handler));
        }
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, action: impl Into<String>, handler: BoxCapability) -> Self {
        self.register(action, handler);
        self
    }

    pub fn get(&self, action: &str) -> Option<&BoxCapability> {
        self.handlers.get(action).map(|h| h.as_ref())
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn list_actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Look up and invoke the handler for `action`.
    ///
    /// An unregistered action is a permanent error.
    pub async fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        match self.handlers.get(action) {
            Some(handler) => handler.invoke(action, parameters).await,
            None => Err(CapabilityError::permanent(format!(
                "unsupported action '{action}'"
            ))),
        }
    }
}
