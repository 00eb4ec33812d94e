//! Streaming talk WebSocket lifecycle: read loop, event writer, teardown.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use talkback_core::protocol::{ClientEvent, ServerEvent};

use crate::state::GatewayState;

/// Drive one streaming connection until the client goes away.
///
/// Text frames carry JSON [`ClientEvent`]s; binary frames are taken as raw
/// audio chunks.
pub async fn handle_talk_socket(state: Arc<GatewayState>, user_id: String, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = state.orchestrator.connect(&user_id, event_tx.clone());
    let conn_id = conn.id().to_string();
    let open = state.connection_opened();
    info!(conn_id = %conn_id, user_id = %user_id, open, "Talk socket connected");
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let writer_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            #[cfg(feature = "metrics")]
            crate::metrics::record_event(event.kind());
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(conn_id = %writer_id, error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!(conn_id = %writer_id, "Socket closed while sending");
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let event = match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "Unparseable client frame");
                    let _ = event_tx.send(ServerEvent::error("parse_error", e.to_string()));
                    continue;
                }
            },
            Ok(Message::Binary(bytes)) => ClientEvent::AudioChunk { bytes },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "Socket read error");
                break;
            }
        };
        conn.handle(event).await;
    }

    let released = conn.disconnect();
    drop(conn);
    send_task.abort();

    let open = state.connection_closed();
    info!(conn_id = %conn_id, released, open, "Talk socket disconnected");
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
}
