//! # frame-session
//!
//! Session-oriented binary messaging over persistent connections.
//!
//! Every message is a [`Frame`]: a little-endian `u32` message type, a `u32`
//! total length and an opaque body. Each connection becomes a [`Session`]
//! with one reader task and one writer task. Sessions are registered in a
//! [`Hub`], which dispatches inbound frames by message type, broadcasts, and
//! reports closes. A [`Server`] accepts connections into a hub; a
//! [`Client`] keeps a fixed pool of outbound sessions with reconnect and
//! request/response correlation.
//!
//! ## Example
//! ```no_run
//! use frame_session::config::{ClientConfig, HubConfig, ServerConfig};
//! use frame_session::protocol::{handler, Hub};
//! use frame_session::{Client, Frame, Server};
//!
//! # async fn run() -> frame_session::Result<()> {
//! let hub = Hub::new(HubConfig::default());
//! hub.register(1, handler(|_session, frame| async move { Ok(Some(frame.body)) }))?;
//!
//! let server = Server::bind(ServerConfig::default(), hub).await?;
//! let running = server.clone();
//! tokio::spawn(async move { running.start().await });
//!
//! let client = Client::new(ClientConfig::default())?;
//! let slot = client.connect(&server.local_addr().to_string()).await?;
//! let reply = client.request(slot, Frame::new(1, &b"hello"[..])).await?;
//! assert_eq!(&reply[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::frame::Frame;
pub use error::{ProtocolError, Result};
pub use protocol::{Hub, Session};
pub use service::{Client, Server};
