//! Timeout defaults and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default connect / handshake timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-session read and write timeout.
pub const SESSION_IO_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long a hub waits for its sessions to terminate on exit.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a client request waits for its reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `future`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
