//! Structured logging middleware for inbound device messages.

use std::sync::Arc;

use tracing::debug;

use super::{Handler, Middleware};

/// Logs every inbound message before passing it along the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |conn, msg| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                debug!(
                    device = %conn.identifier(),
                    channel = conn.metadata().channel.id,
                    kind = ?msg.kind,
                    payload_len = msg.payload.len(),
                    "inbound message"
                );
                next(conn, msg).await;
            })
        })
    }
}
