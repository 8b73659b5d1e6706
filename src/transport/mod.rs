//! # Transport Adapters
//!
//! A session does not care what carries its frames. Each adapter turns an
//! established connection into a [`Connection`]: a stream of decoded frames
//! for the reader loop and a sink of encoded payloads for the writer loop.
//!
//! ## Adapters
//! - **websocket**: one binary WebSocket message per frame (`tokio-tungstenite`)
//! - **stream**: any `AsyncRead + AsyncWrite` framed by [`crate::core::codec::FrameCodec`]
//! - **tls**: rustls server configuration for accepting TLS connections

use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Sink, Stream};

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};

pub mod stream;
pub mod tls;
pub mod websocket;

/// Decoded inbound frames. The stream ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Encoded outbound payloads.
pub type PayloadSink = Pin<Box<dyn Sink<Bytes, Error = ProtocolError> + Send>>;

/// Where a connection came from.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Socket address of the remote end, when known
    pub addr: Option<SocketAddr>,
    /// Client address reported by a proxy header during the upgrade
    pub forwarded_ip: Option<String>,
}

impl PeerInfo {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            forwarded_ip: None,
        }
    }
}

/// An established connection, split for the session's two loops.
pub struct Connection {
    pub frames: FrameStream,
    pub sink: PayloadSink,
    pub peer: PeerInfo,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
