//! HTTP and WebSocket handler definitions for the gateway.
//!
//! Defines `AppState` (the shared state carried through axum extractors),
//! the admission pipeline every device-facing route runs, and re-exports
//! the handler functions for the router.

pub mod health;
pub mod http;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use http::{poll_handler, push_handler};
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use devicehub_core::{Channel, ChannelHash, ChannelResolver};
use metrics::counter;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::connections::{ChannelRegistry, ConnectionManager};
use crate::metrics::ADMISSIONS_REJECTED;
use crate::network::config::SharedConfig;
use crate::network::shutdown::ShutdownController;
use crate::pipeline::{Handler, MiddlewareRegistry};

/// Header carrying the channel access token.
pub const ACCESS_TOKEN_HEADER: &str = "accesstoken";

/// Shared application state passed to all axum handlers via `State`
/// extraction. Holds `Arc` references so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Sharded channel hash-id -> connection manager map.
    pub registry: Arc<ChannelRegistry>,
    /// Channel definition lookup (external store).
    pub resolver: Arc<dyn ChannelResolver>,
    /// Name -> middleware registry consulted at admission.
    pub handlers: Arc<MiddlewareRegistry>,
    /// Channel hash-id codec.
    pub hash_codec: Arc<ChannelHash>,
    /// Live configuration snapshots.
    pub config: Arc<SharedConfig>,
    /// Graceful shutdown controller with health state.
    pub shutdown: Arc<ShutdownController>,
    /// Gateway process start time, used for uptime calculation.
    pub start_time: Instant,
}

/// A rejected admission, mapped verbatim onto the HTTP upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AdmissionError {
    /// Bad hash, unknown channel, or no manager for it.
    NotFound,
    /// Token absent or not in the channel's set.
    Unauthorized,
    /// Empty device id or unknown handler name.
    BadRequest(String),
    /// The channel's manager is closed.
    ServiceUnavailable,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        counter!(ADMISSIONS_REJECTED).increment(1);
        match self {
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").finish_non_exhaustive()
    }
}

/// Everything a route needs once a device has been admitted.
pub(crate) struct Admission {
    pub manager: Arc<ConnectionManager>,
    pub channel: Arc<Channel>,
    pub handler: Handler,
}

/// Runs the admission pipeline shared by every device-facing route:
/// decode the channel hash, resolve the channel, check the access token,
/// require a device id, build the handler chain, find the manager.
pub(crate) async fn admit(
    state: &AppState,
    channel_hash: &str,
    device_id: &str,
    headers: &HeaderMap,
) -> Result<Admission, AdmissionError> {
    let channel_id = state
        .hash_codec
        .decode(channel_hash)
        .map_err(|_| AdmissionError::NotFound)?;

    let Some(channel) = state.resolver.channel_by_id(channel_id).await else {
        debug!(channel_hash, "unknown channel");
        return Err(AdmissionError::NotFound);
    };

    let token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token.is_empty() || !token_allowed(&channel, token) {
        return Err(AdmissionError::Unauthorized);
    }

    if device_id.is_empty() {
        return Err(AdmissionError::BadRequest("empty device id".to_string()));
    }

    let handler = state
        .handlers
        .chain_for(&channel.message_handlers)
        .map_err(|e| AdmissionError::BadRequest(e.to_string()))?;

    let Some(manager) = state.registry.lookup(channel_hash) else {
        debug!(channel_hash, "no manager for channel");
        return Err(AdmissionError::NotFound);
    };

    Ok(Admission {
        manager,
        channel,
        handler,
    })
}

/// Constant-time membership check over the channel's token set.
fn token_allowed(channel: &Channel, presented: &str) -> bool {
    channel.access_tokens.iter().fold(false, |found, token| {
        found | bool::from(token.as_bytes().ct_eq(presented.as_bytes()))
    })
}
