//! Outbound queue between producers and a session's writer loop.
//!
//! Any number of [`Outbound`] handles may enqueue encoded payloads. Exactly
//! one [`OutboundDrain`] exists per queue; it is owned by the writer loop,
//! which suspends until something is queued and then takes everything that
//! is queued at that moment, in enqueue order.
//!
//! [`Outbound::close`] enqueues a sentinel meaning "no more sends". Payloads
//! queued ahead of the sentinel are still delivered; anything behind it is
//! discarded.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Create a connected producer/consumer pair.
pub fn channel() -> (Outbound, OutboundDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbound { tx }, OutboundDrain { rx, closed: false })
}

/// Producer side of the outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Option<Bytes>>,
}

impl Outbound {
    /// Queue one encoded payload. Returns `false` once the consumer is gone.
    pub fn add(&self, payload: Bytes) -> bool {
        self.tx.send(Some(payload)).is_ok()
    }

    /// Queue the "no more sends" sentinel.
    pub fn close(&self) {
        let _ = self.tx.send(None);
    }
}

/// Single consumer side of the outbound queue.
#[derive(Debug)]
pub struct OutboundDrain {
    rx: mpsc::UnboundedReceiver<Option<Bytes>>,
    closed: bool,
}

impl OutboundDrain {
    /// Wait for at least one queued item, then move every queued payload
    /// into `batch`.
    ///
    /// Returns `true` when the sentinel was reached (or every producer is
    /// gone); the caller should write `batch` and stop.
    pub async fn pick(&mut self, batch: &mut Vec<Bytes>) -> bool {
        if self.closed {
            return true;
        }

        let first = match self.rx.recv().await {
            Some(item) => item,
            None => {
                self.closed = true;
                return true;
            }
        };

        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                Some(payload) => batch.push(payload),
                None => {
                    self.closed = true;
                    self.rx.close();
                    return true;
                }
            }
            next = self.rx.try_recv().ok();
        }

        false
    }
}
