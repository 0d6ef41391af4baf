//! One-shot HTTP device routes: push and long-poll.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use devicehub_core::Message;
use tracing::debug;

use super::{admit, AppState};
use crate::connections::{Connection, ConnectionError, ConnectionMetadata, HttpVariant};

/// `POST /channels/{channel_hash}/devices/{device_id}/push`
///
/// The body is the message payload; the handler chain runs once and the
/// connection self-closes without registering.
pub async fn push_handler(
    State(state): State<AppState>,
    Path((channel_hash, device_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let admission = match admit(&state, &channel_hash, &device_id, &headers).await {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let metadata = ConnectionMetadata::new(admission.channel);
    let conn = match admission
        .manager
        .new_http_connection(device_id, HttpVariant::Push, admission.handler, metadata)
        .await
    {
        Ok(conn) => conn,
        Err(ConnectionError::ClosedManager) => {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(e) => {
            debug!(error = %e, "push admission failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    Arc::clone(&conn)
        .process(Message::notification(Bytes::new(), body))
        .await;
    conn.close(false).await;
    StatusCode::ACCEPTED.into_response()
}

/// `GET /channels/{channel_hash}/devices/{device_id}/poll`
///
/// Parks until a message is sent to the device identifier, then answers
/// with its payload. `204 No Content` when nothing arrives within the
/// response timeout (or the connection is closed underneath the poll),
/// `409 Conflict` when a newer poll for the same device superseded this
/// one.
pub async fn poll_handler(
    State(state): State<AppState>,
    Path((channel_hash, device_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let admission = match admit(&state, &channel_hash, &device_id, &headers).await {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let metadata = ConnectionMetadata::new(admission.channel);
    let conn = match admission
        .manager
        .new_http_connection(device_id, HttpVariant::Poll, admission.handler, metadata)
        .await
    {
        Ok(conn) => conn,
        Err(ConnectionError::ClosedManager) => {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(e) => {
            debug!(error = %e, "poll admission failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match conn.await_delivery().await {
        Ok(payload) => (StatusCode::OK, payload).into_response(),
        Err(ConnectionError::Superseded) => StatusCode::CONFLICT.into_response(),
        Err(ConnectionError::ResponseTimeout | ConnectionError::ClosedConnection) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            debug!(error = %e, "poll failed");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
