// Snapshot endpoint: WS /snapshot/{serial}. Text-JSON capture requests
// in, capture_result + binary JPEG (or error JSON) out. The pipeline is
// attached for the lifetime of the connection.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::server::AppState;
use crate::snapshot::pipeline::CaptureOutcome;

const CLOSE_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
struct CaptureMessage {
    #[serde(rename = "type")]
    msg_type: String,
    format: Option<String>,
    quality: Option<u8>,
    save: Option<bool>,
}

pub async fn snapshot_handler(
    Path(serial): Path<String>,
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_snapshot(socket, app, serial))
}

async fn handle_snapshot(mut socket: WebSocket, app: AppState, serial: String) {
    if !app.tracker.is_online(&serial) {
        let _ = send_error(&mut socket, "device_offline", "device is not online").await;
        close_with(&mut socket, CLOSE_ERROR, "device_offline").await;
        return;
    }

    let pipeline = app.registry.get_or_create_snapshot(&serial).await;
    let handle = match pipeline.attach().await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(serial = %serial, error = %e, "snapshot attach failed");
            let _ = send_error(&mut socket, e.wire_code(), &e.to_string()).await;
            close_with(&mut socket, CLOSE_ERROR, e.wire_code()).await;
            return;
        }
    };
    info!(serial = %serial, "snapshot channel open");

    while let Some(incoming) = socket.recv().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let request: CaptureMessage = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                if send_error(&mut socket, "internal_error", &format!("malformed request: {e}"))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        if request.msg_type != "capture" {
            let message = format!("unsupported request type {:?}", request.msg_type);
            if send_error(&mut socket, "internal_error", &message).await.is_err() {
                break;
            }
            continue;
        }
        // "jpeg" is the only format today; the field is reserved.
        if let Some(format) = request.format.as_deref() {
            if format != "jpeg" {
                let message = format!("unsupported format {format:?}");
                if send_error(&mut socket, "internal_error", &message).await.is_err() {
                    break;
                }
                continue;
            }
        }

        let quality = request
            .quality
            .unwrap_or(app.settings.capture_jpeg_quality_default);
        let save = request.save.unwrap_or(false);

        match pipeline.capture(quality, save).await {
            Ok(outcome) => {
                if send_outcome(&mut socket, outcome).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(serial = %serial, error = %e, "capture failed");
                if send_error(&mut socket, e.wire_code(), &e.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }

    pipeline.detach(handle).await;
    info!(serial = %serial, "snapshot channel closed");
}

/// One text result message immediately followed by the JPEG payload of
/// exactly the announced length.
async fn send_outcome(socket: &mut WebSocket, outcome: CaptureOutcome) -> Result<(), Error> {
    let result = json!({
        "type": "capture_result",
        "capture_id": outcome.capture_id,
        "serial": outcome.serial,
        "width": outcome.width,
        "height": outcome.height,
        "captured_at": outcome.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "path": outcome.path,
        "bytes": outcome.jpeg.len(),
    });
    socket
        .send(Message::Text(result.to_string()))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    socket
        .send(Message::Binary(outcome.jpeg))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn send_error(socket: &mut WebSocket, code: &str, message: &str) -> Result<(), Error> {
    let payload = json!({
        "type": "error",
        "code": code,
        "message": message,
        "capture_id": null,
    });
    socket
        .send(Message::Text(payload.to_string()))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
