// Batch dispatcher.
//
// Runs a list of invocations either sequentially (optionally stopping on the
// first non-success) or concurrently, then folds the per-call envelopes into
// a single aggregate envelope: all-success, all-failed, or partial-failure.

use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::ErrorKind;

use super::{Dispatcher, DispatchRequest};

#[derive(Debug, Clone)]
pub struct BatchAction {
    pub action: String,
    pub params: Value,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub worker_id: String,
    pub actions: Vec<BatchAction>,
    pub parallel: bool,
    pub stop_on_error: bool,
    pub trace_id: Option<String>,
}

impl Dispatcher {
    /// Run a batch of calls. Never returns `Err`: the aggregate
    /// envelope's `code` carries the outcome (success, `all-requests-failed`,
    /// or `partial-failure`, the last mapping to HTTP 207 at the transport
    /// boundary).
    pub async fn dispatch_batch(&self, request: BatchRequest) -> Envelope {
        let total = request.actions.len();

        let results: Vec<Envelope> = if request.parallel {
            let futures = request.actions.iter().map(|action| {
                self.dispatch(DispatchRequest {
                    worker_id: request.worker_id.clone(),
                    action: action.action.clone(),
                    params: action.params.clone(),
                    timeout: action.timeout,
                    trace_id: request.trace_id.clone(),
                })
            });
            join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(total);
            for action in &request.actions {
                let envelope = self
                    .dispatch(DispatchRequest {
                        worker_id: request.worker_id.clone(),
                        action: action.action.clone(),
                        params: action.params.clone(),
                        timeout: action.timeout,
                        trace_id: request.trace_id.clone(),
                    })
                    .await;
                let stop = request.stop_on_error && !envelope.is_success();
                results.push(envelope);
                if stop {
                    break;
                }
            }
            results
        };

        let executed = results.len();
        let success_count = results.iter().filter(|e| e.is_success()).count();
        let result_values: Vec<Value> = results
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();

        let data = serde_json::json!({
            "total": total,
            "executed": executed,
            "success_count": success_count,
            "results": result_values,
        });

        let mut envelope = if executed > 0 && success_count == executed {
            Envelope::success(data, "batch")
        } else if success_count == 0 {
            Envelope::error(ErrorKind::AllRequestsFailed, "all batch calls failed", "batch").with_data(data)
        } else {
            Envelope::error(ErrorKind::PartialFailure, "some batch calls failed", "batch").with_data(data)
        };
        envelope = envelope.with_trace_id(request.trace_id.clone());
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::registry::{fn_tool, ContextNeeds, ToolRegistry};
    use crate::session::SessionRouter;
    use std::sync::Arc;

    fn make_dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry
            .register("ok", None, "always succeeds", ContextNeeds::NONE, fn_tool(|p, _c| async move { Ok(p) }))
            .unwrap();
        registry
            .register(
                "bad",
                None,
                "always fails",
                ContextNeeds::NONE,
                fn_tool(|_p, _c| async move {
                    Err(crate::error::ToolError::new(crate::error::ErrorKind::BusinessFailure, "nope"))
                }),
            )
            .unwrap();
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(BackendRegistry::new()),
            Arc::new(SessionRouter::new(Duration::from_secs(60))),
        )
    }

    fn action(name: &str) -> BatchAction {
        BatchAction {
            action: name.to_string(),
            params: Value::Object(Default::default()),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn all_success_yields_success_envelope() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher
            .dispatch_batch(BatchRequest {
                worker_id: "w1".to_string(),
                actions: vec![action("ok"), action("ok")],
                parallel: false,
                stop_on_error: false,
                trace_id: None,
            })
            .await;
        assert!(envelope.is_success());
        assert_eq!(envelope.data["success_count"], 2);
    }

    #[tokio::test]
    async fn partial_failure_maps_to_207() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher
            .dispatch_batch(BatchRequest {
                worker_id: "w1".to_string(),
                actions: vec![action("ok"), action("bad"), action("ok")],
                parallel: false,
                stop_on_error: false,
                trace_id: None,
            })
            .await;
        assert_eq!(envelope.code, ErrorKind::PartialFailure.code());
        assert_eq!(envelope.http_status(), 207);
        assert_eq!(envelope.data["total"], 3);
        assert_eq!(envelope.data["executed"], 3);
        assert_eq!(envelope.data["success_count"], 2);
    }

    #[tokio::test]
    async fn stop_on_error_halts_sequential_execution() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher
            .dispatch_batch(BatchRequest {
                worker_id: "w1".to_string(),
                actions: vec![action("ok"), action("bad"), action("ok")],
                parallel: false,
                stop_on_error: true,
                trace_id: None,
            })
            .await;
        assert_eq!(envelope.data["total"], 3);
        assert_eq!(envelope.data["executed"], 2);
        let results = envelope.data["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_ne!(results[1]["code"], 0);
    }

    #[tokio::test]
    async fn all_failed_yields_all_requests_failed() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher
            .dispatch_batch(BatchRequest {
                worker_id: "w1".to_string(),
                actions: vec![action("bad"), action("bad")],
                parallel: false,
                stop_on_error: false,
                trace_id: None,
            })
            .await;
        assert_eq!(envelope.code, ErrorKind::AllRequestsFailed.code());
    }

    #[tokio::test]
    async fn parallel_execution_preserves_input_order() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher
            .dispatch_batch(BatchRequest {
                worker_id: "w1".to_string(),
                actions: vec![action("ok"), action("bad"), action("ok")],
                parallel: true,
                stop_on_error: false,
                trace_id: None,
            })
            .await;
        let results = envelope.data["results"].as_array().unwrap();
        assert_eq!(results[0]["code"], 0);
        assert_ne!(results[1]["code"], 0);
        assert_eq!(results[2]["code"], 0);
    }
}
