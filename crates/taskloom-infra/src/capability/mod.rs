//! Built-in capabilities shipped with the `tloom` binary.
//!
//! - `echo`: returns its parameters; handy for dry runs and diagnostics.
//! - `http`: performs one HTTP request with reqwest.

pub mod echo;
pub mod http;

use taskloom_core::capability::{BoxCapability, CapabilityRegistry};

pub use echo::EchoCapability;
pub use http::HttpCapability;

/// Registry with every built-in capability under its action name.
pub fn builtin_registry() -> Result<CapabilityRegistry, reqwest::Error> {
    Ok(CapabilityRegistry::new()
        .with("echo", BoxCapability::new(EchoCapability))
        .with("http", BoxCapability::new(HttpCapability::new()?)))
}
