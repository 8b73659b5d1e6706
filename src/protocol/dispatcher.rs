use crate::core::frame::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::session::Session;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a handler produces: an optional reply body sent back with the
/// request's message type.
pub type HandlerResult = Result<Option<Bytes>>;

/// Async message handler.
pub type Handler = Arc<dyn Fn(Session, Frame) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps a handler in another handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Session, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |session, frame| Box::pin(f(session, frame)))
}

/// Build a [`Middleware`] from a closure.
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
struct Table {
    handlers: HashMap<u32, Handler>,
    middleware: Vec<Middleware>,
    fallback: Option<Handler>,
}

/// Message-type dispatch table.
///
/// Each type is registered once; later registrations for the same type are
/// ignored. Middleware is applied at registration time, in the order it was
/// added, so the first middleware ends up innermost.
#[derive(Default)]
pub struct Dispatcher {
    table: RwLock<Table>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware for handlers registered from now on.
    pub fn use_middleware(&self, mw: Middleware) -> Result<()> {
        self.write()?.middleware.push(mw);
        Ok(())
    }

    /// Register `handler` for `msg_type`. Returns `Ok(false)` if the type is
    /// already taken.
    pub fn register(&self, msg_type: u32, handler: Handler) -> Result<bool> {
        let mut table = self.write()?;
        if table.handlers.contains_key(&msg_type) {
            debug!(msg_type, "Handler already registered, ignoring");
            return Ok(false);
        }

        let wrapped = table
            .middleware
            .iter()
            .fold(handler, |inner, mw| mw(inner));
        table.handlers.insert(msg_type, wrapped);
        Ok(true)
    }

    /// Handler for frames whose type has no registration.
    pub fn set_fallback(&self, handler: Handler) -> Result<()> {
        self.write()?.fallback = Some(handler);
        Ok(())
    }

    pub fn lookup(&self, msg_type: u32) -> Option<Handler> {
        self.read().handlers.get(&msg_type).cloned()
    }

    pub fn fallback(&self) -> Option<Handler> {
        self.read().fallback.clone()
    }

    pub fn is_registered(&self, msg_type: u32) -> bool {
        self.read().handlers.contains_key(&msg_type)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Table>> {
        self.table.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })
    }

    // Readers tolerate poisoning: a registration that panicked leaves the
    // table consistent because inserts happen last.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Table> {
        self.table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.read();
        f.debug_struct("Dispatcher")
            .field("handlers", &table.handlers.len())
            .field("middleware", &table.middleware.len())
            .field("fallback", &table.fallback.is_some())
            .finish()
    }
}
