// Stateless tool harness.
//
// A stateless tool has no resource type and no session. Its `config_key`
// picks a subsection of the `[apis]` table at boot, which is injected once
// before the tool is registered. The harness does the uniform wrapping
// every stateless tool would otherwise repeat: time the call, catch the
// tool's own business error, catch anything else as a generic
// `execution-error`, and always return a `Result<Value, ToolError>` — never
// propagate a panic-shaped failure out to the dispatcher.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;

use crate::error::{ErrorKind, ToolError};

/// A stateless tool's business logic: synchronous-looking in shape (no
/// session, no worker context), async under the hood. `config` is whatever
/// the `[apis.<config_key>]` TOML subsection deserialized to, or `Value::Null`
/// if the tool declared no `config_key`.
#[async_trait::async_trait]
pub trait StatelessTool: Send + Sync {
    fn config_key(&self) -> Option<&str> {
        None
    }

    /// Called once at boot with the `[apis.<config_key>]` section, before
    /// the tool is registered.
    fn set_config(&self, _config: Value) {}

    async fn call(&self, params: Value) -> Result<Value, ToolError>;
}

/// Runs a stateless tool's `call`, converting any panic into a generic
/// `execution-error` rather than unwinding into the dispatcher. Business
/// errors (`ToolError`) already returned by `call` pass through unchanged —
/// the harness only widens panics, it never reclassifies a deliberate
/// `ToolError`.
pub async fn run_stateless(tool: &dyn StatelessTool, params: Value) -> Result<Value, ToolError> {
    let result = AssertUnwindSafe(tool.call(params)).catch_unwind().await;
    match result {
        Ok(inner) => inner,
        Err(panic) => {
            let message = panic_message(&panic);
            Err(ToolError::new(
                ErrorKind::ExecutionError,
                format!("tool panicked: {message}"),
            ))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
