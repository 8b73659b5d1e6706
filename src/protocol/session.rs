//! # Session
//!
//! One live connection, driven by two tasks:
//!
//! - the **reader loop** decodes frames, dispatches them through the hub and
//!   runs deferred work between reads;
//! - the **writer loop** drains the outbound queue in batches and writes
//!   them to the transport, one flush per batch.
//!
//! A session moves `Running -> Stopping -> Terminated`. [`Session::close`]
//! performs the first transition; the second happens once both loops have
//! exited, at which point the session leaves its hub.
//!
//! `Session` is a cheap handle; clones refer to the same connection.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::frame::Frame;
use crate::error::ProtocolError;
use crate::protocol::dispatcher::HandlerResult;
use crate::protocol::hub::Hub;
use crate::protocol::outbound::{self, Outbound, OutboundDrain};
use crate::protocol::work_queue::WorkQueue;
use crate::transport::{Connection, FrameStream, PayloadSink, PeerInfo};
use crate::utils::panic::guard_async;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const TERMINATED: u8 = 2;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique key of a connection, independent of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopping,
    Terminated,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUNNING => SessionState::Running,
            STOPPING => SessionState::Stopping,
            _ => SessionState::Terminated,
        }
    }
}

struct SessionInner {
    id: ConnectionId,
    identity: AtomicU32,
    state: AtomicU8,
    loops: AtomicU8,
    outbound: Outbound,
    work: WorkQueue,
    hub: Hub,
    peer: PeerInfo,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
    shutdown: CancellationToken,
    context: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Register a new session with `hub` and start its reader and writer
    /// loops on the current runtime.
    pub fn spawn(hub: &Hub, connection: Connection) -> Session {
        let Connection { frames, sink, peer } = connection;
        let (outbound, drain) = outbound::channel();
        let config = hub.config();

        let session = Session {
            inner: Arc::new(SessionInner {
                id: ConnectionId::next(),
                identity: AtomicU32::new(0),
                state: AtomicU8::new(RUNNING),
                loops: AtomicU8::new(2),
                outbound,
                work: WorkQueue::new(),
                hub: hub.clone(),
                peer,
                read_timeout_ms: AtomicU64::new(duration_ms(config.read_timeout)),
                write_timeout_ms: AtomicU64::new(duration_ms(config.write_timeout)),
                shutdown: CancellationToken::new(),
                context: DashMap::new(),
            }),
        };

        hub.attach(&session);
        hub.metrics().session_opened();
        info!(conn = %session.connection_id(), peer = ?session.remote_addr(), "Session started");

        tokio::spawn(writer_loop(session.clone(), sink, drain));
        tokio::spawn(reader_loop(session.clone(), frames));

        session
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Caller-assigned identity, `0` while unidentified.
    pub fn identity(&self) -> u32 {
        self.inner.identity.load(Ordering::Acquire)
    }

    /// Bind this session to `identity` in its hub.
    ///
    /// Fails if `identity` is `0`, already bound to another live session, or
    /// this session is closing. An existing binding is never evicted. On
    /// success the session's previous identity, if any, is released.
    pub fn set_identity(&self, identity: u32) -> bool {
        if identity == 0 || !self.is_running() {
            return false;
        }
        let hub = &self.inner.hub;
        let id = self.connection_id();
        // The cached identity is stale once the binding was removed from the hub.
        if self.identity() == identity && hub.bound(identity) == Some(id) {
            return true;
        }

        if !hub.claim(identity, id) {
            debug!(conn = %id, identity, "Identity already bound to another session");
            return false;
        }

        let previous = self.inner.identity.swap(identity, Ordering::AcqRel);
        if previous != 0 && previous != identity {
            hub.release(previous, id);
        }

        // close() may have run between the running check and the swap.
        if self.is_closing() {
            hub.release(identity, id);
            return false;
        }

        debug!(conn = %id, identity, previous, "Session identified");
        true
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    /// `true` once `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= STOPPING
    }

    /// `true` once both loops have exited.
    pub fn is_terminated(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Stop the session. Only the first caller gets `true`.
    ///
    /// Queued outbound payloads are still written; pushes made after this
    /// call are refused. The identity binding is released immediately.
    pub fn close(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let identity = self.identity();
        debug!(conn = %self.connection_id(), identity, "Closing session");

        self.inner.work.add_sentinel();
        self.inner.outbound.close();
        if identity != 0 {
            self.inner.hub.release(identity, self.connection_id());
        }
        self.inner.shutdown.cancel();
        true
    }

    /// Encode `frame` and queue it for the writer loop.
    pub fn push(&self, frame: &Frame) -> bool {
        self.push_encoded(frame.to_bytes())
    }

    /// Queue an already encoded frame.
    pub fn push_encoded(&self, payload: Bytes) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.outbound.add(payload)
    }

    /// Run `work` on this session's reader loop.
    pub fn push_work<F>(&self, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }
        self.inner.work.add(Box::new(work));
        true
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer.addr
    }

    /// Client address, preferring proxy headers when the hub trusts them.
    pub fn client_ip(&self) -> Option<String> {
        if self.inner.hub.config().forwarded_by_client_ip {
            if let Some(ip) = &self.inner.peer.forwarded_ip {
                return Some(ip.clone());
            }
        }
        self.inner.peer.addr.map(|addr| addr.ip().to_string())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.read_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.inner
            .read_timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.write_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.inner
            .write_timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// Attach an arbitrary value to this session.
    pub fn set_value<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.inner.context.insert(key.into(), Arc::new(value));
    }

    /// Fetch a value stored with [`Session::set_value`]. `None` when the key
    /// is missing or holds another type.
    pub fn value<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.inner
            .context
            .get(key)
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }

    pub fn remove_value(&self, key: &str) -> bool {
        self.inner.context.remove(key).is_some()
    }

    fn finish_handler(&self, msg_type: u32, outcome: crate::error::Result<HandlerResult>) {
        let metrics = self.inner.hub.metrics();
        match outcome {
            Ok(Ok(Some(body))) => {
                if !self.push(&Frame::new(msg_type, body)) {
                    trace!(conn = %self.connection_id(), msg_type, "Reply dropped, session closing");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                metrics.handler_error();
                warn!(conn = %self.connection_id(), msg_type, error = %e, "Handler failed");
            }
            Err(_) => metrics.handler_panic(),
        }
    }

    fn loop_exited(&self) {
        if self.inner.loops.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        self.inner.state.store(TERMINATED, Ordering::Release);
        self.inner.work.reset();
        self.inner.hub.detach(self.connection_id());
        self.inner.hub.metrics().session_terminated();
        info!(conn = %self.connection_id(), identity = self.identity(), "Session terminated");
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("peer", &self.inner.peer)
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn reader_loop(session: Session, mut frames: FrameStream) {
    let inner = &session.inner;
    let conn = session.connection_id();

    loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,

            _ = inner.work.notified() => {}

            next = timeout(session.read_timeout(), frames.next()) => match next {
                Err(_) => {
                    if session.is_closing() {
                        break;
                    }
                    debug!(conn = %conn, "Read timed out, still waiting");
                }
                Ok(None) => {
                    debug!(conn = %conn, "Peer closed the connection");
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!(conn = %conn, error = %e, "Read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => {
                    inner.hub.metrics().frame_received(u64::from(frame.length()));
                    if !dispatch(&session, frame).await {
                        break;
                    }
                }
            },
        }

        if inner.work.drain() {
            break;
        }
    }

    session.close();
    inner.work.drain();
    inner.hub.notify_closed(&session);
    session.loop_exited();
}

/// Route one frame. Returns `false` when the session must stop.
async fn dispatch(session: &Session, frame: Frame) -> bool {
    let dispatcher = session.hub().dispatcher();
    let msg_type = frame.msg_type;

    if let Some(handler) = dispatcher.lookup(msg_type) {
        let session = session.clone();
        tokio::spawn(async move {
            let target = session.clone();
            let outcome = guard_async("message handler", async move { handler(target, frame).await }).await;
            session.finish_handler(msg_type, outcome);
        });
        return true;
    }

    if let Some(fallback) = dispatcher.fallback() {
        let target = session.clone();
        let outcome = guard_async("fallback handler", async move { fallback(target, frame).await }).await;
        session.finish_handler(msg_type, outcome);
        return true;
    }

    session.hub().metrics().unregistered_frame();
    warn!(
        conn = %session.connection_id(),
        error = %ProtocolError::Unregistered(msg_type),
        "Closing session"
    );
    false
}

async fn writer_loop(session: Session, mut sink: PayloadSink, mut drain: OutboundDrain) {
    let conn = session.connection_id();
    let metrics = session.hub().metrics().clone();
    let mut batch = Vec::new();

    loop {
        batch.clear();
        let stop = drain.pick(&mut batch).await;

        if !batch.is_empty() {
            let write = async {
                for payload in batch.drain(..) {
                    let len = payload.len() as u64;
                    sink.feed(payload).await?;
                    metrics.frame_sent(len);
                }
                sink.flush().await
            };

            match timeout(session.write_timeout(), write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(conn = %conn, error = %e, "Write failed");
                    break;
                }
                Err(_) => {
                    warn!(conn = %conn, "Write timed out");
                    break;
                }
            }
        }

        if stop {
            break;
        }
    }

    if let Ok(Err(e)) = timeout(session.write_timeout(), sink.close()).await {
        trace!(conn = %conn, error = %e, "Closing transport failed");
    }
    session.close();
    session.loop_exited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::transport::stream;

    fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    fn spawn_pair(hub: &Hub) -> (Session, Connection) {
        let (a, b) = tokio::io::duplex(4096);
        let session = Session::spawn(hub, stream::connection(a, PeerInfo::default()));
        (session, stream::connection(b, PeerInfo::default()))
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = hub();
        let (session, _peer) = spawn_pair(&hub);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closing());
        assert!(!session.push(&Frame::empty(1)));
        assert!(!session.push_work(|| {}));
    }

    #[tokio::test]
    async fn test_identity_zero_is_rejected() {
        let hub = hub();
        let (session, _peer) = spawn_pair(&hub);
        assert!(!session.set_identity(0));
        assert_eq!(session.identity(), 0);
    }

    #[tokio::test]
    async fn test_reidentify_releases_previous() {
        let hub = hub();
        let (session, _peer) = spawn_pair(&hub);
        assert!(session.set_identity(10));
        assert!(session.set_identity(11));
        assert!(hub.get(10).is_none());
        assert_eq!(hub.get(11), Some(session.clone()));
    }

    #[tokio::test]
    async fn test_context_values_are_typed() {
        let hub = hub();
        let (session, _peer) = spawn_pair(&hub);
        session.set_value("user", String::from("alice"));
        session.set_value("level", 3u32);

        assert_eq!(session.value::<String>("user").as_deref(), Some("alice"));
        assert_eq!(session.value::<u32>("level"), Some(3));
        assert_eq!(session.value::<u64>("level"), None);
        assert!(session.remove_value("user"));
        assert_eq!(session.value::<String>("user"), None);
    }

    #[tokio::test]
    async fn test_timeouts_default_from_hub_and_can_change() {
        let hub = hub();
        let (session, _peer) = spawn_pair(&hub);
        assert_eq!(session.read_timeout(), hub.config().read_timeout);
        session.set_write_timeout(Duration::from_millis(250));
        assert_eq!(session.write_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_peer_hangup_terminates_session() {
        let hub = hub();
        let (session, peer) = spawn_pair(&hub);
        drop(peer);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_terminated() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should terminate");
        assert_eq!(hub.session_count(), 0);
    }
}
