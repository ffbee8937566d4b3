//! HTTP control API — a thin adapter over the camera registry.
//!
//! Endpoints:
//!   POST   /addCamera             → add a camera `{camera_id, rtsp_url}`
//!   DELETE /deleteCamera?camera_id=… → stop and remove a camera
//!   GET    /status                → API status + camera snapshots
//!
//! Worker-internal failures never surface here; only synchronous registry
//! outcomes are reported. Asynchronous stream health is observable through
//! the `alive` flag in `/status`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, VigilError};
use crate::registry::CameraRegistry;

/// Shared state passed to all handlers.
pub struct AppState {
    pub registry: Arc<CameraRegistry>,
}

#[derive(Deserialize)]
pub struct AddCameraRequest {
    camera_id: Option<String>,
    rtsp_url: Option<String>,
}

#[derive(Deserialize)]
pub struct DeleteCameraParams {
    camera_id: Option<String>,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/addCamera", post(handle_add_camera))
        .route("/deleteCamera", delete(handle_delete_camera))
        .route("/status", get(handle_status))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server; a bind failure is fatal to the caller.
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| VigilError::Config(format!("Cannot bind HTTP API on {addr}: {e}")))?;
    info!(addr, "HTTP API listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(VigilError::Io)
}

fn reply(
    status: StatusCode,
    success: bool,
    message: String,
    camera_id: Option<&str>,
) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "success": success,
        "message": message,
    });
    if let Some(id) = camera_id {
        body["camera_id"] = serde_json::Value::String(id.to_owned());
    }
    (status, Json(body))
}

async fn handle_add_camera(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddCameraRequest>,
) -> impl IntoResponse {
    let (Some(camera_id), Some(rtsp_url)) = (body.camera_id, body.rtsp_url) else {
        return reply(
            StatusCode::BAD_REQUEST,
            false,
            "Missing required fields: camera_id and rtsp_url".into(),
            None,
        )
        .into_response();
    };

    match state.registry.add(&camera_id, &rtsp_url) {
        Ok(()) => reply(
            StatusCode::OK,
            true,
            format!("Camera {camera_id} started successfully"),
            Some(&camera_id),
        )
        .into_response(),
        Err(e @ VigilError::AlreadyExists { .. }) => {
            reply(StatusCode::CONFLICT, false, e.to_string(), Some(&camera_id)).into_response()
        }
        Err(e) => {
            reply(StatusCode::BAD_REQUEST, false, e.to_string(), Some(&camera_id)).into_response()
        }
    }
}

async fn handle_delete_camera(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteCameraParams>,
) -> impl IntoResponse {
    let Some(camera_id) = params.camera_id else {
        return reply(
            StatusCode::BAD_REQUEST,
            false,
            "Missing required parameter: camera_id".into(),
            None,
        )
        .into_response();
    };

    match state.registry.delete(&camera_id).await {
        Ok(()) => reply(
            StatusCode::OK,
            true,
            format!("Camera {camera_id} stopped successfully"),
            Some(&camera_id),
        )
        .into_response(),
        Err(e @ VigilError::NotFound { .. }) => {
            reply(StatusCode::NOT_FOUND, false, e.to_string(), Some(&camera_id)).into_response()
        }
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            false,
            e.to_string(),
            Some(&camera_id),
        )
        .into_response(),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cameras = state.registry.list();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "api_status": "running",
            "active_cameras": cameras.len(),
            "cameras": cameras,
        })),
    )
}
