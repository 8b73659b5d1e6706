//! # Core Protocol Components
//!
//! Low-level frame handling and the byte-stream codec.
//!
//! ## Components
//! - **Frame**: one logical message (type + body) and its wire encoding
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Type(4, LE)] [Length(4, LE) = 8 + body] [Body(N)]
//! ```
//!
//! ## Limits
//! - Maximum frame size: 1000 MiB, checked before any allocation
//! - No checksum and no compression: integrity belongs to the transport

pub mod codec;
pub mod frame;
