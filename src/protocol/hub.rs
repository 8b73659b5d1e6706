//! # Session Hub
//!
//! The hub owns every live session of a server or client:
//!
//! - an arena keyed by [`ConnectionId`] holding each session from spawn
//!   until both of its loops have exited;
//! - an identity index `u32 -> ConnectionId` for sessions that have been
//!   identified (first binding wins, nothing is evicted);
//! - the dispatch table consulted by every reader loop;
//! - callbacks fired once per session when it closes.
//!
//! Broadcast and shutdown work on snapshots taken from the concurrent maps,
//! so a slow or failing session never holds up the others.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::core::frame::Frame;
use crate::error::Result;
use crate::protocol::dispatcher::{Dispatcher, Handler, Middleware};
use crate::protocol::session::{ConnectionId, Session};
use crate::utils::metrics::Metrics;
use crate::utils::panic::guard;

/// Called once per session after its reader loop has finished, with the
/// identity the session held at that time.
pub type CloseCallback = Arc<dyn Fn(&Session, u32) + Send + Sync>;

struct HubInner {
    sessions: DashMap<ConnectionId, Session>,
    identities: DashMap<u32, ConnectionId>,
    dispatcher: Dispatcher,
    close_callbacks: RwLock<Vec<CloseCallback>>,
    config: HubConfig,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    /// Build a hub reporting into an existing metrics collector.
    pub fn with_metrics(config: HubConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: DashMap::new(),
                identities: DashMap::new(),
                dispatcher: Dispatcher::new(),
                close_callbacks: RwLock::new(Vec::new()),
                config,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Wrap every handler registered after this call.
    pub fn use_middleware(&self, mw: Middleware) -> Result<()> {
        self.inner.dispatcher.use_middleware(mw)
    }

    /// Register the handler for `msg_type`. The first registration wins.
    pub fn register(&self, msg_type: u32, handler: Handler) -> Result<bool> {
        self.inner.dispatcher.register(msg_type, handler)
    }

    /// Handler for frames whose type is not registered. Without one, such a
    /// frame closes the session.
    pub fn set_fallback(&self, handler: Handler) -> Result<()> {
        self.inner.dispatcher.set_fallback(handler)
    }

    pub fn on_session_close<F>(&self, callback: F)
    where
        F: Fn(&Session, u32) + Send + Sync + 'static,
    {
        self.inner
            .close_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Live session bound to `identity`.
    pub fn get(&self, identity: u32) -> Option<Session> {
        let id = *self.inner.identities.get(&identity)?.value();
        self.inner.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Bind `session` to `identity` unless another session already holds it.
    pub fn put_if_absent(&self, identity: u32, session: &Session) -> bool {
        session.set_identity(identity)
    }

    /// Drop the binding for `identity`, returning the session it pointed to.
    /// The session itself keeps running.
    pub fn remove(&self, identity: u32) -> Option<Session> {
        let (_, id) = self.inner.identities.remove(&identity)?;
        self.inner.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Push a frame to the session bound to `identity`.
    pub fn push(&self, identity: u32, frame: &Frame) -> bool {
        self.get(identity)
            .map(|session| session.push(frame))
            .unwrap_or(false)
    }

    /// Queue work on the reader loop of the session bound to `identity`.
    pub fn push_work<F>(&self, identity: u32, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.get(identity)
            .map(|session| session.push_work(work))
            .unwrap_or(false)
    }

    /// Send `frame` to every identified session. The frame is encoded once.
    /// Returns how many sessions accepted it.
    pub fn push_to_all(&self, frame: &Frame) -> usize {
        let payload = frame.to_bytes();
        let sessions = self.sessions();
        let delivered = sessions
            .iter()
            .filter(|session| session.push_encoded(payload.clone()))
            .count();
        debug!(msg_type = frame.msg_type, targets = sessions.len(), delivered, "Broadcast");
        delivered
    }

    /// Snapshot of identified sessions.
    pub fn sessions(&self) -> Vec<Session> {
        let ids: Vec<ConnectionId> = self
            .inner
            .identities
            .iter()
            .map(|entry| *entry.value())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.inner.sessions.get(&id).map(|entry| entry.value().clone()))
            .collect()
    }

    /// Snapshot of every session that has not yet terminated, identified or not.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Visit a snapshot of identified sessions.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        for session in self.sessions() {
            f(&session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Close every session and wait for all of them to terminate, giving up
    /// after the configured shutdown timeout.
    pub async fn exit(&self) {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.shutdown_timeout;
        info!(sessions = self.session_count(), "Hub shutting down");

        loop {
            let remaining = self
                .all_sessions()
                .into_iter()
                .filter(|session| {
                    session.close();
                    !session.is_terminated()
                })
                .count();

            if remaining == 0 {
                info!("All sessions terminated");
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, timeout = ?config.shutdown_timeout, "Gave up waiting for sessions to terminate");
                break;
            }
            tokio::time::sleep(config.exit_poll_interval).await;
        }

        self.inner.metrics.log_metrics();
    }

    pub(crate) fn attach(&self, session: &Session) {
        self.inner
            .sessions
            .insert(session.connection_id(), session.clone());
    }

    pub(crate) fn detach(&self, id: ConnectionId) {
        self.inner.sessions.remove(&id);
    }

    /// Connection currently bound to `identity` in the index.
    pub(crate) fn bound(&self, identity: u32) -> Option<ConnectionId> {
        self.inner.identities.get(&identity).map(|entry| *entry.value())
    }

    pub(crate) fn claim(&self, identity: u32, id: ConnectionId) -> bool {
        match self.inner.identities.entry(identity) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    /// Remove the binding only if it still points at `id`.
    pub(crate) fn release(&self, identity: u32, id: ConnectionId) {
        self.inner
            .identities
            .remove_if(&identity, |_, bound| *bound == id);
    }

    pub(crate) fn notify_closed(&self, session: &Session) {
        let callbacks = self
            .inner
            .close_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let identity = session.identity();

        for callback in callbacks {
            let _ = guard("session close callback", || callback(session, identity));
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("sessions", &self.inner.sessions.len())
            .field("identities", &self.inner.identities.len())
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}
