//! # Client
//!
//! A fixed pool of outbound sessions addressed by slot number.
//!
//! A slot is a stable handle to one remote address. The session behind it
//! (and the identity it is registered under) changes every time the slot
//! reconnects. Slots released by [`Client::disconnect`] go onto a free list
//! and are handed out again before the high-water mark grows.
//!
//! Requests are correlated with replies through a `u64` key. By default the
//! key is `(slot << 32) | msg_type`, so one request per message type may be
//! outstanding on each slot; install another key function with
//! [`Client::with_options`] when the protocol carries its own request ids.
//! Replies are not registered as handlers: they reach the hub's fallback
//! handler, which hands the body to the waiting request.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, HubConfig, TransportKind};
use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::handler;
use crate::protocol::hub::Hub;
use crate::protocol::session::Session;
use crate::transport::{stream, websocket, Connection};
use crate::utils::panic::guard;
use crate::utils::timeout::with_timeout_error;

/// Maps `(slot, frame)` to the correlation key of a request or its reply.
pub type KeyFn = Arc<dyn Fn(u32, &Frame) -> u64 + Send + Sync>;

/// Called with the slot number after every successful connect or reconnect.
pub type ConnectCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Default correlation key: the slot in the high half, the message type in
/// the low half.
pub fn default_key(slot: u32, frame: &Frame) -> u64 {
    (u64::from(slot) << 32) | u64::from(frame.msg_type)
}

struct PendingRequest {
    id: u64,
    identity: u32,
    reply: oneshot::Sender<Bytes>,
}

type PendingMap = DashMap<u64, PendingRequest>;

#[derive(Default)]
struct Slot {
    identity: AtomicU32,
    address: Mutex<Option<String>>,
    in_use: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_done: Notify,
}

impl Slot {
    /// Wait until no reconnect is running on this slot.
    async fn reconnect_settled(&self) {
        loop {
            let done = self.reconnect_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if !self.reconnecting.load(Ordering::Acquire) {
                return;
            }
            done.await;
        }
    }
}

/// Clears a slot's reconnect flag and wakes waiters when the reconnect
/// attempt ends.
struct ReconnectGuard<'a>(&'a Slot);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.reconnecting.store(false, Ordering::Release);
        self.0.reconnect_done.notify_waiters();
    }
}

/// Removes a request's correlation entry however the request ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    key: u64,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.pending.remove_if(&self.key, |_, request| request.id == id);
    }
}

struct ClientInner {
    config: ClientConfig,
    hub: Hub,
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
    high_water: AtomicU32,
    next_identity: AtomicU32,
    next_request: AtomicU64,
    pending: Arc<PendingMap>,
    identity_slots: Arc<DashMap<u32, u32>>,
    key_fn: KeyFn,
    connect_callbacks: RwLock<Vec<ConnectCallback>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with its own hub and the default correlation key.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let hub = Hub::new(HubConfig {
            forwarded_by_client_ip: false,
            ..HubConfig::default()
        });
        Self::with_options(config, hub, Arc::new(default_key))
    }

    /// Client on an existing hub with a custom correlation key.
    ///
    /// The client installs the hub's fallback handler and a close callback;
    /// handlers registered on the hub for server-initiated pushes keep
    /// working alongside request/response traffic.
    pub fn with_options(config: ClientConfig, hub: Hub, key_fn: KeyFn) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let identity_slots: Arc<DashMap<u32, u32>> = Arc::new(DashMap::new());

        {
            let pending = pending.clone();
            let identity_slots = identity_slots.clone();
            let key_fn = key_fn.clone();
            hub.set_fallback(handler(move |session: Session, frame: Frame| {
                route_reply(&pending, &identity_slots, &key_fn, &session, frame);
                async { Ok(None) }
            }))?;
        }

        {
            let pending = pending.clone();
            let identity_slots = identity_slots.clone();
            hub.on_session_close(move |_session, identity| {
                if identity == 0 {
                    return;
                }
                identity_slots.remove(&identity);
                // Dropping the reply senders fails the waiting requests.
                pending.retain(|_, request| request.identity != identity);
            });
        }

        let slots = (0..config.capacity).map(|_| Slot::default()).collect();

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                hub,
                slots,
                free: Mutex::new(Vec::new()),
                high_water: AtomicU32::new(0),
                next_identity: AtomicU32::new(1),
                next_request: AtomicU64::new(1),
                pending,
                identity_slots,
                key_fn,
                connect_callbacks: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn capacity(&self) -> u32 {
        self.inner.config.capacity
    }

    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.inner
            .connect_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Dial `address` on a free slot and return the slot number.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn connect(&self, address: &str) -> Result<u32> {
        let inner = &self.inner;
        let slot = inner.allocate_slot()?;

        let session = match inner.dial(address).await {
            Ok(connection) => Session::spawn(&inner.hub, connection),
            Err(e) => {
                inner.release_slot(slot);
                return Err(e);
            }
        };

        let state = inner.slot(slot)?;
        *state.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());

        let identity = match inner.bind(slot, &session) {
            Ok(identity) => identity,
            Err(e) => {
                *state.address.lock().unwrap_or_else(PoisonError::into_inner) = None;
                inner.release_slot(slot);
                return Err(e);
            }
        };
        state.in_use.store(true, Ordering::Release);

        info!(slot, identity, "Client connected");
        inner.fire_connect(slot);
        Ok(slot)
    }

    /// Replace the slot's session with a fresh connection to the same
    /// address and return the new identity.
    ///
    /// Only one reconnect per slot runs at a time; concurrent callers get
    /// [`ProtocolError::ReconnectInProgress`]. If the slot is already live
    /// its current identity is returned without dialing.
    #[instrument(skip(self))]
    pub async fn reconnect(&self, slot: u32) -> Result<u32> {
        let inner = &self.inner;
        let state = inner.slot(slot)?;
        if !state.in_use.load(Ordering::Acquire) {
            return Err(ProtocolError::InvalidSlot(slot));
        }

        if state
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(slot, "Reconnect already in progress");
            return Err(ProtocolError::ReconnectInProgress(slot));
        }
        let _guard = ReconnectGuard(state);

        if let Some(session) = self.live_session(slot) {
            return Ok(session.identity());
        }

        let address = state
            .address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProtocolError::InvalidSlot(slot))?;

        if let Some(old) = self.session(slot) {
            old.close();
        }
        state.identity.store(0, Ordering::Release);

        let connection = inner.dial(&address).await?;
        let session = Session::spawn(&inner.hub, connection);
        let identity = inner.bind(slot, &session)?;

        inner.hub.metrics().reconnect();
        info!(slot, identity, address = %address, "Client reconnected");
        inner.fire_connect(slot);
        Ok(identity)
    }

    /// Send `frame` and wait for the reply, using the configured key
    /// function and response timeout.
    pub async fn request(&self, slot: u32, frame: Frame) -> Result<Bytes> {
        let key = (self.inner.key_fn)(slot, &frame);
        self.request_with(slot, key, frame, self.inner.config.response_timeout)
            .await
    }

    /// Send `frame` and wait up to `wait` for the reply correlated by `key`.
    ///
    /// A timeout closes the slot's session; other requests still waiting on
    /// that session fail with [`ProtocolError::ConnectionClosed`].
    #[instrument(skip(self, frame), fields(msg_type = frame.msg_type))]
    pub async fn request_with(&self, slot: u32, key: u64, frame: Frame, wait: Duration) -> Result<Bytes> {
        let inner = &self.inner;
        let session = self.ensure_live(slot).await?;

        let id = inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        match inner.pending.entry(key) {
            Entry::Occupied(_) => return Err(ProtocolError::DuplicateRequest(key)),
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    id,
                    identity: session.identity(),
                    reply,
                });
            }
        }
        let _pending = PendingGuard {
            pending: &inner.pending,
            key,
            id,
        };

        if !session.push(&frame) {
            return Err(ProtocolError::ConnectionClosed);
        }

        let outcome = with_timeout_error(
            async { response.await.map_err(|_| ProtocolError::ConnectionClosed) },
            wait,
        )
        .await;

        if let Err(ProtocolError::Timeout) = outcome {
            inner.hub.metrics().request_timeout();
            warn!(slot, key, timeout = ?wait, "Request timed out, closing session");
            session.close();
        }
        outcome
    }

    /// Send `frame` without waiting for a reply.
    pub async fn request_async(&self, slot: u32, frame: Frame) -> Result<()> {
        let session = self.ensure_live(slot).await?;
        if session.push(&frame) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Close the slot's session and return the slot to the free list.
    pub fn disconnect(&self, slot: u32) -> Result<()> {
        let inner = &self.inner;
        let state = inner.slot(slot)?;

        if let Some(session) = self.session(slot) {
            session.close();
        }
        state.identity.store(0, Ordering::Release);
        *state.address.lock().unwrap_or_else(PoisonError::into_inner) = None;

        if state.in_use.swap(false, Ordering::AcqRel) {
            inner.release_slot(slot);
            info!(slot, "Client slot released");
        }
        Ok(())
    }

    /// Session currently registered for `slot`, if any.
    pub fn session(&self, slot: u32) -> Option<Session> {
        let identity = self.identity(slot)?;
        self.inner.hub.get(identity)
    }

    /// Identity of the slot's current session, if one was bound.
    pub fn identity(&self, slot: u32) -> Option<u32> {
        let state = self.inner.slot(slot).ok()?;
        match state.identity.load(Ordering::Acquire) {
            0 => None,
            identity => Some(identity),
        }
    }

    pub fn is_live(&self, slot: u32) -> bool {
        self.live_session(slot).is_some()
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close every session of this client and wait for them to terminate.
    pub async fn stop(&self) {
        self.inner.hub.exit().await;
    }

    fn live_session(&self, slot: u32) -> Option<Session> {
        self.session(slot).filter(Session::is_running)
    }

    async fn ensure_live(&self, slot: u32) -> Result<Session> {
        let state = self.inner.slot(slot)?;
        if !state.in_use.load(Ordering::Acquire) {
            return Err(ProtocolError::InvalidSlot(slot));
        }
        if let Some(session) = self.live_session(slot) {
            return Ok(session);
        }

        let attempts = self.inner.config.max_reconnect_attempts.max(1);
        let mut last_error = ProtocolError::ConnectionClosed;
        let mut attempt = 0;
        while attempt < attempts {
            match self.reconnect(slot).await {
                Ok(_) => {
                    if let Some(session) = self.live_session(slot) {
                        return Ok(session);
                    }
                }
                Err(ProtocolError::ReconnectInProgress(_)) => {
                    // Another caller is dialing; its outcome decides ours.
                    let wait = self.inner.config.connection_timeout;
                    if tokio::time::timeout(wait, state.reconnect_settled()).await.is_ok() {
                        if let Some(session) = self.live_session(slot) {
                            return Ok(session);
                        }
                        continue;
                    }
                    last_error = ProtocolError::Timeout;
                }
                Err(e) => {
                    debug!(slot, attempt, error = %e, "Reconnect attempt failed");
                    last_error = e;
                }
            }
            attempt += 1;
            if attempt < attempts {
                tokio::time::sleep(self.inner.config.reconnect_delay).await;
            }
        }

        warn!(slot, attempts, "Slot could not be brought back online");
        Err(last_error)
    }
}

impl ClientInner {
    fn slot(&self, slot: u32) -> Result<&Slot> {
        slot.checked_sub(1)
            .and_then(|index| self.slots.get(index as usize))
            .ok_or(ProtocolError::InvalidSlot(slot))
    }

    fn allocate_slot(&self) -> Result<u32> {
        if let Some(slot) = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop() {
            return Ok(slot);
        }

        let capacity = self.config.capacity;
        let mut current = self.high_water.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return Err(ProtocolError::CapacityExceeded(capacity));
            }
            match self.high_water.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self, slot: u32) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
    }

    fn next_identity(&self) -> u32 {
        loop {
            let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
            if identity != 0 {
                return identity;
            }
        }
    }

    /// Give `session` a fresh identity and make it the slot's session.
    fn bind(&self, slot: u32, session: &Session) -> Result<u32> {
        let identity = self.next_identity();
        self.identity_slots.insert(identity, slot);

        if !session.set_identity(identity) {
            self.identity_slots.remove(&identity);
            session.close();
            return Err(ProtocolError::ConnectionClosed);
        }

        self.slot(slot)?.identity.store(identity, Ordering::Release);
        Ok(identity)
    }

    async fn dial(&self, address: &str) -> Result<Connection> {
        let dial = async {
            match self.config.transport {
                TransportKind::WebSocket => websocket::connect(address).await,
                TransportKind::Tcp => stream::connect(address).await,
            }
        };
        with_timeout_error(dial, self.config.connection_timeout).await
    }

    fn fire_connect(&self, slot: u32) {
        let callbacks = self
            .connect_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            let _ = guard("client connect callback", || callback(slot));
        }
    }
}

fn route_reply(
    pending: &PendingMap,
    identity_slots: &DashMap<u32, u32>,
    key_fn: &KeyFn,
    session: &Session,
    frame: Frame,
) {
    let identity = session.identity();
    let Some(slot) = identity_slots.get(&identity).map(|entry| *entry.value()) else {
        debug!(identity, msg_type = frame.msg_type, "Frame from a session with no slot");
        return;
    };

    let key = key_fn(slot, &frame);
    match pending.remove(&key) {
        Some((_, request)) => {
            if request.reply.send(frame.body).is_err() {
                trace!(slot, key, "Requester stopped waiting");
            }
        }
        None => debug!(slot, key, msg_type = frame.msg_type, "Reply with no pending request"),
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("capacity", &self.inner.config.capacity)
            .field("high_water", &self.inner.high_water.load(Ordering::Relaxed))
            .field("pending", &self.inner.pending.len())
            .field("hub", &self.inner.hub)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(capacity: u32) -> Client {
        Client::new(ClientConfig {
            capacity,
            ..ClientConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn test_default_key_packs_slot_and_type() {
        let frame = Frame::empty(0x0102);
        assert_eq!(default_key(3, &frame), (3u64 << 32) | 0x0102);
        assert_ne!(default_key(1, &frame), default_key(2, &frame));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = Client::new(ClientConfig {
            capacity: 0,
            ..ClientConfig::default()
        });
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[test]
    fn test_slot_allocation_prefers_free_list() {
        let client = client(2);
        let inner = &client.inner;
        assert_eq!(inner.allocate_slot().ok(), Some(1));
        assert_eq!(inner.allocate_slot().ok(), Some(2));
        assert!(matches!(
            inner.allocate_slot(),
            Err(ProtocolError::CapacityExceeded(2))
        ));

        inner.release_slot(1);
        assert_eq!(inner.allocate_slot().ok(), Some(1));
    }

    #[test]
    fn test_invalid_slots() {
        let client = client(1);
        assert!(matches!(client.inner.slot(0), Err(ProtocolError::InvalidSlot(0))));
        assert!(matches!(client.inner.slot(2), Err(ProtocolError::InvalidSlot(2))));
        assert!(client.identity(1).is_none());
        assert!(!client.is_live(1));
    }

    #[test]
    fn test_identity_counter_skips_zero() {
        let client = client(1);
        client.inner.next_identity.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.inner.next_identity(), u32::MAX);
        assert_eq!(client.inner.next_identity(), 1);
    }

    #[tokio::test]
    async fn test_request_on_unconnected_slot_fails() {
        let client = client(1);
        let result = client.request(1, Frame::empty(1)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidSlot(1))));
        assert_eq!(client.pending_requests(), 0);
    }
}
