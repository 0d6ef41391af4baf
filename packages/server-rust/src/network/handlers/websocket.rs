//! WebSocket upgrade handler: the device admission path.
//!
//! Admission order: decode the channel hash, resolve the channel, check the
//! access token, require a device id, build the handler chain, find the
//! manager — then upgrade the transport and register the connection. Every rejection maps verbatim
//! onto the upgrade response; transport failures after the upgrade are the
//! connection's problem, not the route's.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::{admit, AppState};
use crate::connections::{split_websocket, ConnectionMetadata};

/// `GET /channels/{channel_hash}/devices/{device_id}/ws`
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    Path((channel_hash, device_id)): Path<(String, String)>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let admission = match admit(&state, &channel_hash, &device_id, &headers).await {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let buffers = state.config.load().websocket.buffer_sizes.clone();
    ws.max_message_size(buffers.read)
        .write_buffer_size(buffers.write)
        .on_upgrade(move |socket| async move {
            let (reader, writer) = split_websocket(socket);
            let metadata = ConnectionMetadata::new(admission.channel);
            match admission
                .manager
                .new_websocket_connection(
                    device_id.clone(),
                    reader,
                    writer,
                    admission.handler,
                    metadata,
                )
                .await
            {
                Ok(_) => {
                    debug!(channel = %channel_hash, device = %device_id, "device connected");
                }
                Err(e) => {
                    // Post-upgrade rejection (manager closed in the gap);
                    // the transport already got its goodbye frame.
                    warn!(channel = %channel_hash, device = %device_id, error = %e, "admission failed after upgrade");
                }
            }
        })
        .into_response()
}
