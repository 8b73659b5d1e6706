//! # Services
//!
//! The two ends built on a [`crate::protocol::hub::Hub`]:
//!
//! - **server**: accepts inbound connections and spawns a session for each
//! - **client**: a fixed pool of outbound sessions with reconnect and
//!   request/response correlation

pub mod client;
pub mod server;

pub use client::{default_key, Client, ConnectCallback, KeyFn};
pub use server::{ExitCallback, Server};
