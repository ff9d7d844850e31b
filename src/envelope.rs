// Uniform response envelope and scoped timer.
//
// Every tool call — success or failure — produces exactly this shape so
// downstream formatters, log sinks and clients only ever branch on `code`.
// Encoding success as a boolean in the data body would force every tool to
// reinvent this; instead the envelope owns it.

use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

use crate::error::{ErrorKind, ToolError};

#[derive(Debug, Clone, Serialize, Default)]
pub struct EnvelopeMeta {
    pub tool: String,
    pub execution_time_ms: Option<f64>,
    pub resource_type: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: String,
    /// Set when the session this call ran under was created and destroyed
    /// purely for this one call.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub temporary_session: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub code: u32,
    pub message: String,
    pub data: Value,
    pub meta: EnvelopeMeta,
}

impl Envelope {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn success(data: Value, tool: impl Into<String>) -> Self {
        Envelope {
            code: 0,
            message: "success".to_string(),
            data,
            meta: EnvelopeMeta {
                tool: tool.into(),
                trace_id: new_trace_id(),
                ..Default::default()
            },
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>, tool: impl Into<String>) -> Self {
        Envelope {
            code: kind.code(),
            message: message.into(),
            data: Value::Null,
            meta: EnvelopeMeta {
                tool: tool.into(),
                trace_id: new_trace_id(),
                ..Default::default()
            },
        }
    }

    pub fn from_tool_error(err: &ToolError, tool: impl Into<String>) -> Self {
        let mut envelope = Envelope::error(err.kind, err.message(), tool);
        if let Some(data) = err.data.clone() {
            envelope.data = data;
        }
        envelope
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        if let Some(id) = trace_id {
            self.meta.trace_id = id;
        }
        self
    }

    pub fn with_execution_time(mut self, ms: f64) -> Self {
        self.meta.execution_time_ms = Some(ms);
        self
    }

    pub fn with_resource_type(mut self, resource_type: Option<String>) -> Self {
        self.meta.resource_type = resource_type;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.meta.session_id = session_id;
        self
    }

    pub fn with_temporary_session(mut self, temporary: bool) -> Self {
        self.meta.temporary_session = temporary;
        self
    }

    /// HTTP status this envelope maps to at the transport boundary.
    pub fn http_status(&self) -> u16 {
        if self.code == 0 {
            200
        } else if self.code == ErrorKind::PartialFailure.code() {
            207
        } else if self.code == ErrorKind::ResourceNotInitialized.code() {
            404
        } else if self.code < 5000 {
            400
        } else {
            500
        }
    }
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Scoped wall-clock timer. Every dispatch path creates one at entry and
/// reads `elapsed_ms()` on every exit path (success, error, timeout, panic
/// unwind via `Drop` is intentionally not used — callers always read the
/// value explicitly so it lands in `meta.execution_time_ms`).
pub struct ResponseTimer {
    start: Instant,
}

impl ResponseTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for ResponseTimer {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_has_zero_code() {
        let env = Envelope::success(serde_json::json!({"a": 1}), "demo");
        assert!(env.is_success());
        assert_eq!(env.http_status(), 200);
    }

    #[test]
    fn error_envelope_maps_class_to_status() {
        let env = Envelope::error(ErrorKind::InvalidInput, "bad", "demo");
        assert_eq!(env.http_status(), 400);
        let env = Envelope::error(ErrorKind::ExecutionError, "boom", "demo");
        assert_eq!(env.http_status(), 500);
        let env = Envelope::error(ErrorKind::PartialFailure, "partial", "demo");
        assert_eq!(env.http_status(), 207);
        let env = Envelope::error(ErrorKind::ResourceNotInitialized, "missing", "demo");
        assert_eq!(env.http_status(), 404);
    }

    #[test]
    fn timer_reports_nonnegative_elapsed() {
        let timer = ResponseTimer::start();
        assert!(timer.elapsed_ms() >= 0.0);
    }
}
