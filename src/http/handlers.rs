// HTTP handlers for every endpoint this service exposes. Status-code
// mapping is `Envelope::http_status`, applied uniformly via
// `IntoResponse for Envelope` in `http::mod`.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dispatch::{BatchAction, BatchRequest, DispatchRequest};
use crate::envelope::Envelope;
use crate::error::ErrorKind;
use crate::session::SessionStatus;

use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub tools_count: usize,
    pub active_workers: usize,
    pub total_sessions: usize,
}

pub async fn ready(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let dispatcher = &state.dispatcher;
    Json(ReadinessResponse {
        status: "ready",
        tools_count: dispatcher.registry().len(),
        active_workers: dispatcher.sessions().active_workers().await,
        total_sessions: dispatcher.sessions().total_sessions().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub worker_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    pub timeout: Option<f64>,
    pub trace_id: Option<String>,
}

pub async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteBody>) -> Envelope {
    state
        .dispatcher
        .dispatch(DispatchRequest {
            worker_id: body.worker_id,
            action: body.action,
            params: body.params,
            timeout: body.timeout.map(Duration::from_secs_f64),
            trace_id: body.trace_id,
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct BatchActionBody {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBatchBody {
    pub worker_id: String,
    pub actions: Vec<BatchActionBody>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub stop_on_error: bool,
    pub trace_id: Option<String>,
}

pub async fn execute_batch(State(state): State<AppState>, Json(body): Json<ExecuteBatchBody>) -> Envelope {
    let actions = body
        .actions
        .into_iter()
        .map(|a| BatchAction {
            action: a.action,
            params: a.params,
            timeout: a.timeout.map(Duration::from_secs_f64),
        })
        .collect();
    state
        .dispatcher
        .dispatch_batch(BatchRequest {
            worker_id: body.worker_id,
            actions,
            parallel: body.parallel,
            stop_on_error: body.stop_on_error,
            trace_id: body.trace_id,
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub worker_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub session_config: Option<Value>,
    pub custom_name: Option<String>,
}

pub async fn create_session(State(state): State<AppState>, Json(body): Json<CreateSessionBody>) -> Envelope {
    let dispatcher = &state.dispatcher;
    let session = dispatcher
        .sessions()
        .get_or_create(
            &body.worker_id,
            &body.resource_type,
            dispatcher.backends(),
            body.session_config,
            body.custom_name.as_deref(),
            false,
        )
        .await;
    let status = session.status().await;
    let data = json!({
        "session_id": session.session_id,
        "session_name": session.session_name,
        "resource_type": session.resource_type,
        "session_status": status,
        "compatibility_mode": session.compatibility_mode,
        // Whatever the backend's `initialize` returned (e.g. the VM pool's
        // `pool_id`/endpoint) — opaque to this handler, useful to callers.
        "session_data": session.state.read().await.data.clone(),
    });
    if status == SessionStatus::Error {
        let detail = session.state.read().await.error.clone().unwrap_or_default();
        Envelope::error(ErrorKind::ResourceNotInitialized, "session failed to initialize", "create_session")
            .with_data(json!({ "details": detail, "session_id": session.session_id }))
            .with_resource_type(Some(session.resource_type.clone()))
            .with_session_id(Some(session.session_id.clone()))
    } else {
        Envelope::success(data, "create_session")
            .with_resource_type(Some(session.resource_type.clone()))
            .with_session_id(Some(session.session_id.clone()))
    }
}

#[derive(Debug, Deserialize)]
pub struct DestroySessionBody {
    pub worker_id: String,
    pub resource_type: String,
}

pub async fn destroy_session(State(state): State<AppState>, Json(body): Json<DestroySessionBody>) -> Envelope {
    let dispatcher = &state.dispatcher;
    match dispatcher.sessions().destroy(&body.worker_id, &body.resource_type, dispatcher.backends()).await {
        Some(session) => Envelope::success(json!({ "destroyed": true }), "destroy_session")
            .with_resource_type(Some(body.resource_type))
            .with_session_id(Some(session.session_id)),
        None => Envelope::error(ErrorKind::ResourceNotInitialized, "no session to destroy", "destroy_session")
            .with_resource_type(Some(body.resource_type)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub worker_id: String,
}

pub async fn list_sessions(State(state): State<AppState>, Query(q): Query<ListSessionsQuery>) -> Envelope {
    let sessions = state.dispatcher.sessions().list_worker(&q.worker_id).await;
    let mut snapshots = Vec::with_capacity(sessions.len());
    for session in &sessions {
        snapshots.push(session.snapshot().await);
    }
    Envelope::success(json!({ "sessions": snapshots }), "list_sessions")
}

#[derive(Debug, Deserialize)]
pub struct RefreshSessionBody {
    pub worker_id: String,
    pub resource_type: Option<String>,
}

pub async fn refresh_session(State(state): State<AppState>, Json(body): Json<RefreshSessionBody>) -> Envelope {
    let refreshed = state
        .dispatcher
        .sessions()
        .refresh(&body.worker_id, body.resource_type.as_deref())
        .await;
    Envelope::success(json!({ "refreshed_count": refreshed }), "refresh_session")
}

#[derive(Debug, Deserialize)]
pub struct WorkerDisconnectBody {
    pub worker_id: String,
}

pub async fn worker_disconnect(State(state): State<AppState>, Json(body): Json<WorkerDisconnectBody>) -> Envelope {
    let dispatcher = &state.dispatcher;
    let cleaned = dispatcher.sessions().destroy_worker(&body.worker_id, dispatcher.backends()).await;
    Envelope::success(json!({ "sessions_cleaned": cleaned }), "worker_disconnect")
}

#[derive(Debug, Deserialize, Default)]
pub struct WarmupBackendsBody {
    pub backends: Option<Vec<String>>,
}

pub async fn warmup_backends(State(state): State<AppState>, body: Option<Json<WarmupBackendsBody>>) -> Envelope {
    let dispatcher = &state.dispatcher;
    let targets = body.and_then(|Json(b)| b.backends).unwrap_or_else(|| dispatcher.backends().names());

    let mut results = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for name in &targets {
        match dispatcher.backends().warmup(name).await {
            Ok(ran) => {
                results.insert(name.clone(), json!(true));
                let _ = ran;
            }
            Err(e) => {
                results.insert(name.clone(), json!(false));
                errors.insert(name.clone(), json!(e.to_string()));
            }
        }
    }
    let summary = format!("{}/{} backends warmed", results.values().filter(|v| v.as_bool() == Some(true)).count(), targets.len());
    let data = if errors.is_empty() {
        json!({ "status": "ok", "results": results, "summary": summary })
    } else {
        json!({ "status": "partial", "results": results, "summary": summary, "errors": errors })
    };
    Envelope::success(data, "warmup_backends")
}

pub async fn warmup_status(State(state): State<AppState>) -> Envelope {
    let dispatcher = &state.dispatcher;
    let mut backends = serde_json::Map::new();
    for name in dispatcher.backends().names() {
        let warmed = dispatcher.backends().is_warmed_up(&name);
        backends.insert(name, json!({ "loaded": true, "warmed_up": warmed }));
    }
    let summary = format!(
        "{}/{} backends warmed",
        backends.values().filter(|v| v["warmed_up"] == true).count(),
        backends.len()
    );
    Envelope::success(json!({ "backends": backends, "summary": summary }), "warmup_status")
}

#[derive(Debug, Deserialize, Default)]
pub struct ListToolsQuery {
    #[serde(default)]
    pub include_hidden: bool,
}

#[derive(Debug, Serialize)]
struct ToolInfo {
    name: String,
    full_name: String,
    resource_type: Option<String>,
    stateless: bool,
    description: String,
}

pub async fn list_tools(State(state): State<AppState>, Query(q): Query<ListToolsQuery>) -> Envelope {
    let tools: Vec<ToolInfo> = state
        .dispatcher
        .registry()
        .list(q.include_hidden)
        .into_iter()
        .map(|t| ToolInfo {
            name: t.canonical_name.rsplit_once(':').map(|(_, s)| s.to_string()).unwrap_or_else(|| t.canonical_name.clone()),
            full_name: t.canonical_name.clone(),
            resource_type: t.resource_type.clone(),
            stateless: t.resource_type.is_none(),
            description: t.description.clone(),
        })
        .collect();
    let count = tools.len();
    Envelope::success(json!({ "tools": tools, "count": count }), "list_tools")
}

pub async fn tool_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> (axum::http::StatusCode, Envelope) {
    match state.dispatcher.registry().get(&name) {
        Some(entry) => (
            axum::http::StatusCode::OK,
            Envelope::success(
                json!({
                    "name": entry.canonical_name.rsplit_once(':').map(|(_, s)| s.to_string()).unwrap_or_else(|| entry.canonical_name.clone()),
                    "full_name": entry.canonical_name,
                    "resource_type": entry.resource_type,
                    "stateless": entry.resource_type.is_none(),
                    "description": entry.description,
                }),
                "tool_schema",
            ),
        ),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            Envelope::error(ErrorKind::InvalidRequestFormat, format!("tool not found: {name}"), "tool_schema"),
        ),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ShutdownBody {
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub cleanup_sessions: bool,
}

fn default_true() -> bool {
    true
}

pub async fn shutdown(State(state): State<AppState>, body: Option<Json<ShutdownBody>>) -> Envelope {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let dispatcher = &state.dispatcher;

    let cleaned = if body.cleanup_sessions && !body.force {
        dispatcher.sessions().shutdown_all(dispatcher.backends()).await
    } else {
        0
    };
    dispatcher.backends().shutdown_all().await;

    state.shutdown.notify_one();
    Envelope::success(json!({ "sessions_cleaned": cleaned }), "shutdown")
}
