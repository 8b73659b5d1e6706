//! Panic containment for user callbacks.
//!
//! Handlers, deferred work and close callbacks all run user code. A panic in
//! one of them is caught at the invocation boundary, logged, and converted to
//! [`ProtocolError::HandlerPanic`]; it never unwinds through a session loop.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt;
use tracing::error;

use crate::error::{constants, ProtocolError, Result};

/// Render a panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        constants::ERR_UNKNOWN_PANIC.to_string()
    }
}

/// Run a synchronous callback, containing any panic.
pub fn guard<T>(context: &'static str, f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(context, panic = %message, "Recovered from panic");
        ProtocolError::HandlerPanic(message)
    })
}

/// Await a future, containing any panic raised while polling it.
pub async fn guard_async<F, T>(context: &'static str, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!(context, panic = %message, "Recovered from panic");
            ProtocolError::HandlerPanic(message)
        })
}
