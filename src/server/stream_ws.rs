// Stream endpoint: WS /stream/{serial}. Binary messages only, one
// Annex-B unit per message; client frames are ignored.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::server::AppState;

/// 1000: normal closure. 1011: server error.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Capture preset applied when this request creates the worker.
    pub preset: Option<String>,
}

pub async fn stream_handler(
    Path(serial): Path<String>,
    Query(query): Query<StreamQuery>,
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, app, serial, query))
}

async fn handle_stream(socket: WebSocket, app: AppState, serial: String, query: StreamQuery) {
    let (mut sender, mut receiver) = socket.split();

    if !app.tracker.is_online(&serial) {
        close_with(&mut sender, CLOSE_ERROR, "device_offline").await;
        return;
    }

    let config = query
        .preset
        .as_deref()
        .and_then(CaptureConfig::preset)
        .unwrap_or_default();

    let worker = match app.registry.get_or_create_worker(&serial, config).await {
        Ok(worker) => worker,
        Err(e) => {
            close_with(&mut sender, CLOSE_ERROR, e.wire_code()).await;
            return;
        }
    };

    let mut sub = worker.subscribe();
    info!(serial = %serial, subscriber_id = sub.id, prefill = sub.prefill_len, "stream client joined");

    loop {
        tokio::select! {
            unit = sub.rx.recv() => match unit {
                Some(unit) => {
                    if sender.send(Message::Binary(unit.bytes.to_vec())).await.is_err() {
                        // This client's transport failed; the broadcast
                        // is unaffected.
                        break;
                    }
                }
                None => {
                    // Worker drained its subscribers.
                    let (code, reason) = match worker.fatal_reason() {
                        Some(_) => (CLOSE_ERROR, "internal_error"),
                        None => (CLOSE_NORMAL, "stream ended"),
                    };
                    close_with(&mut sender, code, reason).await;
                    return;
                }
            },
            incoming = drain_client(&mut receiver) => if incoming.is_none() {
                break;
            },
        }
    }

    worker.unsubscribe(sub.id);
    debug!(serial = %serial, subscriber_id = sub.id, "stream client left");
}

/// Swallow client frames per the wire contract; `None` when the client
/// is gone.
async fn drain_client(receiver: &mut SplitStream<WebSocket>) -> Option<()> {
    match receiver.next().await {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => None,
        Some(Ok(_)) => Some(()),
    }
}

async fn close_with(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
