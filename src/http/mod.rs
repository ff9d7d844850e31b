// HTTP transport layer.
//
// CORS + `TraceLayer` wrapped around a plain `Router`, `with_state` applied
// once at the end. Handlers return `impl IntoResponse`, extracting shared
// state via `State<AppState>`.

pub mod handlers;
pub mod state;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::envelope::Envelope;

pub use state::AppState;

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

async fn uptime(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "uptime_secs": state.uptime_secs() }))
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/uptime", get(uptime))
        .route("/execute", post(handlers::execute))
        .route("/execute/batch", post(handlers::execute_batch))
        .route(
            "/sessions",
            get(handlers::list_sessions)
                .post(handlers::create_session)
                .delete(handlers::destroy_session),
        )
        .route("/sessions/refresh", post(handlers::refresh_session))
        .route("/workers/disconnect", post(handlers::worker_disconnect))
        .route(
            "/backends/warmup",
            get(handlers::warmup_status).post(handlers::warmup_backends),
        )
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{name}", get(handlers::tool_schema))
        .route("/shutdown", post(handlers::shutdown))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
