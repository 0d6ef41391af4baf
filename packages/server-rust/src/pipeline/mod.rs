//! The message handler pipeline applied to inbound device messages.
//!
//! A [`Middleware`] wraps a [`Handler`] and returns a new one; a
//! [`MiddlewareStack`] composes them right-to-left over a terminal no-op,
//! so the first middleware pushed is the outermost wrap and runs first.
//! Channels name their handlers; admission resolves the names against a
//! [`MiddlewareRegistry`] supplied by the application and rejects unknown
//! names before the transport is upgraded.

pub mod indexer;
pub mod logger;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use devicehub_core::Message;

use crate::connections::{Connection, ConnectionError};

pub use indexer::{IndexerMiddleware, NullIndexSink};
pub use logger::LoggerMiddleware;

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A composed message handler, invoked by the reader task for every inbound
/// `Request` and `Notification` frame. Handler latency intentionally
/// back-pressures the connection's reader.
pub type Handler = Arc<dyn Fn(Arc<dyn Connection>, Message) -> HandlerFuture + Send + Sync>;

/// The terminal handler: does nothing.
#[must_use]
pub fn noop_handler() -> Handler {
    Arc::new(|_conn, _msg| Box::pin(async {}))
}

/// A named stage in the handler pipeline.
pub trait Middleware: Send + Sync {
    /// Wraps `next`, returning the handler for this stage. The returned
    /// handler decides if and when to invoke `next`.
    fn wrap(&self, next: Handler) -> Handler;
}

// ---------------------------------------------------------------------------
// MiddlewareStack
// ---------------------------------------------------------------------------

/// An ordered stack of middlewares awaiting composition.
#[derive(Default)]
pub struct MiddlewareStack {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware. The first appended runs first (outermost).
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Composes the stack right-to-left over the terminal no-op.
    #[must_use]
    pub fn chain(&self) -> Handler {
        let mut handler = noop_handler();
        for middleware in self.middlewares.iter().rev() {
            handler = middleware.wrap(handler);
        }
        handler
    }
}

// ---------------------------------------------------------------------------
// MiddlewareRegistry
// ---------------------------------------------------------------------------

/// Name → middleware lookup used at admission.
///
/// The registry contents are supplied by the application; the connection
/// subsystem never enumerates middlewares itself.
#[derive(Default)]
pub struct MiddlewareRegistry {
    by_name: HashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a middleware under a name, replacing any previous holder.
    pub fn register(&mut self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.by_name.insert(name.into(), middleware);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.by_name.get(name).cloned()
    }

    /// Builds the composed handler for a channel's ordered handler names.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::UnknownHandler`] for the first name with
    /// no registered middleware; admission turns this into a bad request.
    pub fn chain_for(&self, names: &[String]) -> Result<Handler, ConnectionError> {
        let mut stack = MiddlewareStack::new();
        for name in names {
            let middleware = self
                .get(name)
                .ok_or_else(|| ConnectionError::UnknownHandler(name.clone()))?;
            stack.push(middleware);
        }
        Ok(stack.chain())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
