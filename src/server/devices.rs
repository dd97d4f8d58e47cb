// Device list and device-change SSE endpoints.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use tracing::warn;

use crate::adb::tracker::Device;
use crate::server::AppState;

pub async fn list_devices(State(app): State<AppState>) -> Json<Vec<Device>> {
    Json(app.tracker.devices())
}

/// `event: devices` with the full current set on every change. Late
/// joiners get the current set as their first event.
pub async fn device_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = app.tracker.subscribe();
    let stream = async_stream::stream! {
        while let Some(devices) = rx.recv().await {
            match serde_json::to_string(&devices) {
                Ok(json) => yield Ok(Event::default().event("devices").data(json)),
                Err(e) => warn!(error = %e, "device set failed to serialize"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
