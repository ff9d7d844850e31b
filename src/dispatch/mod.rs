// Dispatcher and batch dispatcher.
//
// The dispatcher is the one place every call funnels through: name
// resolution, backend warmup, session acquisition, context injection,
// timeout handling, and the temporary-session cleanup / persistent-session
// refresh policy. Tool bodies themselves never see the session router or
// the backend registry directly — only what the dispatcher injects into
// `ToolContext`; tools must not reach into the router on their own.

pub mod batch;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backend::BackendRegistry;
use crate::envelope::{Envelope, ResponseTimer};
use crate::error::ErrorKind;
use crate::registry::{ContextNeeds, ToolContext, ToolFn, ToolRegistry};
use crate::session::{Session, SessionRouter, SessionStatus};

pub use batch::{BatchAction, BatchRequest};

/// One call as the dispatcher sees it: `(action, params, worker_id,
/// timeout?, trace_id?)`.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub worker_id: String,
    pub action: String,
    pub params: Value,
    pub timeout: Option<Duration>,
    pub trace_id: Option<String>,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    backends: Arc<BackendRegistry>,
    sessions: Arc<SessionRouter>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, backends: Arc<BackendRegistry>, sessions: Arc<SessionRouter>) -> Self {
        Self {
            registry,
            backends,
            sessions,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn sessions(&self) -> &SessionRouter {
        &self.sessions
    }

    /// Run one call end to end. Never returns an `Err` — every outcome,
    /// including resolution failures and timeouts, is an envelope, so a
    /// failure is indistinguishable from a success at the transport layer
    /// until the caller inspects `code`.
    pub async fn dispatch(&self, request: DispatchRequest) -> Envelope {
        let timer = ResponseTimer::start();

        let resolved = match self.registry.resolve(&request.action) {
            Ok(resolved) => resolved,
            Err(err) => {
                return Envelope::from_tool_error(&err, request.action.clone())
                    .with_trace_id(request.trace_id.clone())
                    .with_execution_time(timer.elapsed_ms());
            }
        };

        let entry = match self.registry.get(&resolved.canonical_name) {
            Some(entry) => entry,
            None => {
                // Resolved but vanished: treat as unknown rather than panic.
                return Envelope::error(ErrorKind::InvalidRequestFormat, "tool not found", request.action.clone())
                    .with_trace_id(request.trace_id.clone())
                    .with_execution_time(timer.elapsed_ms());
            }
        };

        if let Some(resource_type) = &resolved.resource_type {
            if let Err(e) = self.backends.warmup(resource_type).await {
                return Envelope::error(
                    ErrorKind::ResourceNotInitialized,
                    format!("backend warmup failed: {e}"),
                    resolved.canonical_name.clone(),
                )
                .with_resource_type(Some(resource_type.clone()))
                .with_trace_id(request.trace_id.clone())
                .with_execution_time(timer.elapsed_ms());
            }
        }

        let mut ephemeral = false;
        let session: Option<Arc<Session>> = if let Some(resource_type) = &resolved.resource_type {
            match self.sessions.get(&request.worker_id, resource_type).await {
                Some(session) => Some(session),
                None => {
                    ephemeral = true;
                    Some(
                        self.sessions
                            .get_or_create(&request.worker_id, resource_type, &self.backends, None, None, true)
                            .await,
                    )
                }
            }
        } else {
            None
        };

        if let Some(session) = &session {
            if session.status().await == SessionStatus::Error {
                let detail = session.state.read().await.error.clone().unwrap_or_default();
                let envelope = Envelope::error(
                    ErrorKind::ResourceNotInitialized,
                    "backend session failed to initialize",
                    resolved.canonical_name.clone(),
                )
                .with_data(serde_json::json!({ "details": detail }))
                .with_resource_type(resolved.resource_type.clone())
                .with_session_id(Some(session.session_id.clone()))
                .with_trace_id(request.trace_id.clone())
                .with_temporary_session(ephemeral)
                .with_execution_time(timer.elapsed_ms());

                if ephemeral {
                    self.sessions
                        .destroy(&request.worker_id, resolved.resource_type.as_deref().unwrap(), &self.backends)
                        .await;
                }
                return envelope;
            }
        }

        let ctx = ToolContext {
            worker_id: entry.needs.contains(ContextNeeds::WORKER_ID).then(|| request.worker_id.clone()),
            trace_id: entry.needs.contains(ContextNeeds::TRACE_ID).then(|| request.trace_id.clone()).flatten(),
            session_id: entry
                .needs
                .contains(ContextNeeds::SESSION_ID)
                .then(|| session.as_ref().map(|s| s.session_id.clone()))
                .flatten(),
            session_info: entry
                .needs
                .contains(ContextNeeds::SESSION_INFO)
                .then(|| session.clone())
                .flatten(),
        };

        let call = entry.func.call(request.params.clone(), ctx);
        let (outcome, timed_out) = match request.timeout {
            Some(duration) => match tokio::time::timeout(duration, call).await {
                Ok(result) => (result, false),
                Err(_) => (Err(crate::error::ToolError::from_kind(ErrorKind::TimeoutError)), true),
            },
            None => (call.await, false),
        };

        let mut envelope = match outcome {
            Ok(data) => Envelope::success(data, resolved.canonical_name.clone()),
            Err(tool_error) => Envelope::from_tool_error(&tool_error, resolved.canonical_name.clone()),
        };
        envelope = envelope
            .with_resource_type(resolved.resource_type.clone())
            .with_session_id(session.as_ref().map(|s| s.session_id.clone()))
            .with_trace_id(request.trace_id.clone())
            .with_temporary_session(ephemeral)
            .with_execution_time(timer.elapsed_ms());

        if let Some(resource_type) = &resolved.resource_type {
            if ephemeral {
                self.sessions.destroy(&request.worker_id, resource_type, &self.backends).await;
            } else if !timed_out {
                self.sessions.refresh(&request.worker_id, Some(resource_type.as_str())).await;
            }
        }

        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::error::ToolError;
    use crate::registry::fn_tool;
    use async_trait::async_trait;

    fn make_dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(BackendRegistry::new()),
            Arc::new(SessionRouter::new(Duration::from_secs(60))),
        )
    }

    fn request(action: &str) -> DispatchRequest {
        DispatchRequest {
            worker_id: "w1".to_string(),
            action: action.to_string(),
            params: Value::Object(Default::default()),
            timeout: None,
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_input_error_without_touching_sessions() {
        let dispatcher = make_dispatcher();
        let envelope = dispatcher.dispatch(request("nope")).await;
        assert_eq!(envelope.code, ErrorKind::InvalidRequestFormat.code());
        assert_eq!(dispatcher.sessions().total_sessions().await, 0);
    }

    #[tokio::test]
    async fn stateless_tool_dispatches_without_resource_type() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "search",
                None,
                "search",
                ContextNeeds::NONE,
                fn_tool(|params, _ctx| async move { Ok(params) }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(BackendRegistry::new()), Arc::new(SessionRouter::new(Duration::from_secs(60))));

        let envelope = dispatcher.dispatch(request("search")).await;
        assert!(envelope.is_success());
        assert!(envelope.meta.resource_type.is_none());
        assert!(envelope.meta.session_id.is_none());
    }

    struct OkBackend;

    #[async_trait]
    impl Backend for OkBackend {
        fn name(&self) -> &str {
            "rag"
        }
        async fn initialize(&self, _worker_id: &str, _config: &Value) -> Result<Value, crate::error::ServiceError> {
            Ok(serde_json::json!({ "loaded": true }))
        }
    }

    #[tokio::test]
    async fn ephemeral_session_is_destroyed_after_call() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "rag:search",
                None,
                "search",
                ContextNeeds::SESSION_TOOL,
                fn_tool(|params, ctx| async move {
                    assert!(ctx.session_info.is_some());
                    Ok(params)
                }),
            )
            .unwrap();
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(OkBackend));
        let sessions = Arc::new(SessionRouter::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(backends), sessions.clone());

        let envelope = dispatcher.dispatch(request("rag:search")).await;
        assert!(envelope.is_success());
        assert!(envelope.meta.temporary_session);
        assert_eq!(sessions.total_sessions().await, 0);
    }

    #[tokio::test]
    async fn persistent_session_is_refreshed_not_destroyed() {
        let mut registry = ToolRegistry::new();
        registry
            .register("rag:search", None, "search", ContextNeeds::NONE, fn_tool(|params, _ctx| async move { Ok(params) }))
            .unwrap();
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(OkBackend));
        let sessions = Arc::new(SessionRouter::new(Duration::from_secs(60)));
        sessions.get_or_create("w1", "rag", &backends, None, None, false).await;
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(backends), sessions.clone());

        let envelope = dispatcher.dispatch(request("rag:search")).await;
        assert!(envelope.is_success());
        assert!(!envelope.meta.temporary_session);
        assert_eq!(sessions.total_sessions().await, 1);
    }

    struct FailingInitBackend;

    #[async_trait]
    impl Backend for FailingInitBackend {
        fn name(&self) -> &str {
            "vm"
        }
        async fn initialize(&self, _worker_id: &str, _config: &Value) -> Result<Value, crate::error::ServiceError> {
            Err(crate::error::ServiceError::Other("boom".into()))
        }
    }

    #[tokio::test]
    async fn failed_session_init_is_resource_not_initialized() {
        let mut registry = ToolRegistry::new();
        registry
            .register("vm:click", None, "click", ContextNeeds::NONE, fn_tool(|params, _ctx| async move { Ok(params) }))
            .unwrap();
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(FailingInitBackend));
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(backends), Arc::new(SessionRouter::new(Duration::from_secs(60))));

        let envelope = dispatcher.dispatch(request("vm:click")).await;
        assert_eq!(envelope.code, ErrorKind::ResourceNotInitialized.code());
        assert_eq!(dispatcher.sessions().total_sessions().await, 0);
    }

    #[tokio::test]
    async fn timeout_produces_timeout_error_and_cleans_up_ephemeral_session() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "rag:slow",
                None,
                "slow",
                ContextNeeds::NONE,
                fn_tool(|_params, _ctx| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(OkBackend));
        let sessions = Arc::new(SessionRouter::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(backends), sessions.clone());

        let mut req = request("rag:slow");
        req.timeout = Some(Duration::from_millis(1));
        let envelope = dispatcher.dispatch(req).await;
        assert_eq!(envelope.code, ErrorKind::TimeoutError.code());
        assert_eq!(sessions.total_sessions().await, 0);
    }

    #[test]
    fn ambiguous_simple_name_resolution_error() {
        let mut registry = ToolRegistry::new();
        registry.register("alpha:do", None, "", ContextNeeds::NONE, fn_tool(|p, _c| async move { Ok(p) })).unwrap();
        registry.register("beta:do", None, "", ContextNeeds::NONE, fn_tool(|p, _c| async move { Ok(p) })).unwrap();
        let err = registry.resolve("do").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequestFormat);
    }
}
