//! # Protocol Layer
//!
//! Sessions, the queues that feed their loops, and the hub that registers
//! and dispatches for them.
//!
//! ## Components
//! - **outbound**: batching queue drained by a session's writer loop
//! - **work_queue**: deferred callbacks run on a session's reader loop
//! - **dispatcher**: message-type table with middleware and a fallback
//! - **session**: one connection and its reader/writer loops
//! - **hub**: session registry, broadcast, close callbacks, shutdown

pub mod dispatcher;
pub mod hub;
pub mod outbound;
pub mod session;
pub mod work_queue;

pub use dispatcher::{handler, middleware, Handler, HandlerResult, Middleware};
pub use hub::{CloseCallback, Hub};
pub use session::{ConnectionId, Session, SessionState};
