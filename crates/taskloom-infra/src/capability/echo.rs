//! `echo` capability: returns its parameters unchanged.
//!
//! Recognised control parameters:
//! - `fail`: `"transient"` or `"permanent"` makes the call fail with that tag.
//! - `delay_ms`: sleep before answering.

use std::time::Duration;

use serde_json::{Map, Value};
use taskloom_core::capability::Capability;
use taskloom_types::error::CapabilityError;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        if let Some(ms) = parameters.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        match parameters.get("fail").and_then(Value::as_str) {
            Some("transient") => {
                return Err(CapabilityError::transient(format!("{action}: requested transient failure")));
            }
            Some("permanent") => {
                return Err(CapabilityError::permanent(format!("{action}: requested permanent failure")));
            }
            Some(other) => {
                return Err(CapabilityError::permanent(format!(
                    "{action}: unknown failure mode '{other}'"
                )));
            }
            None => {}
        }

        tracing::debug!(action, keys = parameters.len(), "echo");
        Ok(Value::Object(parameters.clone()))
    }
}
