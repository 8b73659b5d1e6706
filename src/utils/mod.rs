//! # Utility Modules
//!
//! Supporting utilities shared by sessions, the hub, the server and the client.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: per-hub atomic counters
//! - **Panic**: panic containment around user callbacks
//! - **Timeout**: timeout defaults and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod panic;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
