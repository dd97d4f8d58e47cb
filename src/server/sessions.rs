// Session administration: metrics, capture-config updates, teardown.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::config::CaptureConfig;
use crate::registry::SessionMetrics;
use crate::server::AppState;

pub async fn session_metrics(State(app): State<AppState>) -> Json<Vec<SessionMetrics>> {
    Json(app.registry.metrics().await)
}

/// Replace a worker's capture config. The worker restarts when running;
/// stream subscribers stay connected and pick up a fresh GOP at the
/// next IDR.
pub async fn update_session_config(
    Path(serial): Path<String>,
    State(app): State<AppState>,
    Json(config): Json<CaptureConfig>,
) -> Response {
    let worker = match app
        .registry
        .get_or_create_worker(&serial, config.clone())
        .await
    {
        Ok(worker) => worker,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.wire_code(), "message": e.to_string() })),
            )
                .into_response();
        }
    };

    info!(serial = %serial, "capture config update requested");
    match worker.update_config(config).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.wire_code(), "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// Tear down the worker and snapshot pipeline for one device.
pub async fn stop_session(Path(serial): Path<String>, State(app): State<AppState>) -> StatusCode {
    app.registry.stop(&serial).await;
    StatusCode::NO_CONTENT
}
