// HTTP/WebSocket boundary: device listing and events, session metrics,
// and the per-device stream/snapshot endpoints.

pub mod devices;
pub mod sessions;
pub mod snapshot_ws;
pub mod stream_ws;

use std::sync::Arc;

use axum::routing::{delete, get, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::adb::tracker::DeviceTracker;
use crate::config::Config;
use crate::registry::SessionRegistry;

pub struct App {
    pub registry: Arc<SessionRegistry>,
    pub tracker: Arc<DeviceTracker>,
    pub settings: Arc<Config>,
}

pub type AppState = Arc<App>;

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(devices::list_devices))
        .route("/api/devices/events", get(devices::device_events))
        .route("/api/sessions", get(sessions::session_metrics))
        .route(
            "/api/sessions/:serial/config",
            put(sessions::update_session_config),
        )
        .route("/api/sessions/:serial", delete(sessions::stop_session))
        .route("/stream/:serial", get(stream_ws::stream_handler))
        .route("/snapshot/:serial", get(snapshot_ws::snapshot_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}
