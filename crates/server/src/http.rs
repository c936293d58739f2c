//! HTTP control plane
//!
//! Session lifecycle on the reliable channel: create (under admission and
//! backpressure), inspect, cancel, delete; plus liveness and the WebSocket
//! media upgrade.

use axum::{
    extract::{Json, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use duplex_core::{EngineHealth, Error};

use crate::state::AppState;
use crate::websocket;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .route("/health", get(health_check))
        .route("/ws/:session_id", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub state: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise, helpful voice assistant. \
     Replies are spoken aloud, so keep them short and natural.";

/// POST /api/sessions
async fn create_session(
    State(state): State<AppState>,
    request: Option<Json<CreateSessionRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let prompt = request
        .system_prompt
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let session = match state.build_session(&prompt) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "session build failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let effects = state.effects();
    match state.sessions.admit(session, &effects).await {
        Ok(session) => {
            if let Err(e) = session.pipeline.open().await {
                tracing::error!(error = %e, "session open failed");
                if let Some(session) = state.sessions.remove(&session.id) {
                    state.close_session(session).await;
                }
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response();
            }
            tracing::info!(session_id = %session.id, "session created");
            (
                StatusCode::CREATED,
                Json(CreateSessionResponse {
                    session_id: session.id.clone(),
                    state: session.pipeline.state().name().to_string(),
                }),
            )
                .into_response()
        }
        Err(Error::Admission {
            message,
            retry_after_s,
        }) => {
            tracing::warn!(%message, "session admission rejected");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("Retry-After", retry_after_s.to_string())],
                Json(serde_json::json!({
                    "error": message,
                    "backpressure_level": state.backpressure_level().name(),
                })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/sessions/:id
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session = state.sessions.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let metrics = session.pipeline.metrics();
    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "state": session.pipeline.state().name(),
        "active": session.is_active(),
        "t_audio_ms": session.pipeline.audio_clock_ms(),
        "turns_completed": metrics.turns_completed,
        "barge_in_count": metrics.barge_in_count,
        "avg_ttfa_ms": metrics.avg_ttfa_ms(),
    })))
}

/// GET /api/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({
        "sessions": sessions,
        "count": sessions.len(),
        "capacity": state.sessions.max_sessions(),
        "backpressure_level": state.backpressure_level().name(),
    }))
}

/// DELETE /api/sessions/:id — idempotent.
async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if let Some(session) = state.sessions.remove(&id) {
        state.close_session(session).await;
    }
    StatusCode::NO_CONTENT
}

/// POST /api/sessions/:id/cancel — explicit user STOP.
async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let session = state.sessions.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    session.touch();
    session.pipeline.user_stop().await;
    Ok(StatusCode::ACCEPTED)
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let engine_health = [
        ("asr", state.engines.asr.health()),
        ("llm", state.engines.llm.health()),
        ("tts", state.engines.tts.health()),
    ];
    let animation_health = state.engines.animation.as_ref().map(|a| a.health());

    let degraded = engine_health
        .iter()
        .any(|(_, h)| *h != EngineHealth::Ready);
    let mut checks = serde_json::Map::new();
    for (name, health) in engine_health {
        checks.insert(name.to_string(), serde_json::json!(health));
    }
    if let Some(health) = animation_health {
        checks.insert("animation".to_string(), serde_json::json!(health));
    }

    let status_code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status_code,
        Json(serde_json::json!({
            "status": if degraded { "degraded" } else { "healthy" },
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": state.sessions.count(),
            "backpressure_level": state.backpressure_level().name(),
            "checks": checks,
        })),
    )
}
