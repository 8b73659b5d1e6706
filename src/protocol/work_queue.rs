//! Deferred work executed on a session's reader loop.
//!
//! Producers append callbacks without blocking. The reader loop drains the
//! queue between reads and once more after it stops reading, so work queued
//! just before shutdown still runs. A `None` entry is the stop sentinel
//! pushed by `Session::close`.

use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

use crate::utils::panic::guard;

/// A unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub struct WorkQueue {
    list: Mutex<Vec<Option<Work>>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback and wake the reader loop.
    pub fn add(&self, work: Work) {
        self.push(Some(work));
    }

    /// Append the stop sentinel.
    pub fn add_sentinel(&self) {
        self.push(None);
    }

    fn push(&self, entry: Option<Work>) {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        self.notify.notify_one();
    }

    /// Resolves once work has been added since the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Take everything queued and run it in FIFO order.
    ///
    /// Each callback runs behind its own panic guard. Returns `true` if the
    /// stop sentinel was among the drained entries.
    pub fn drain(&self) -> bool {
        let list = std::mem::take(&mut *self.list.lock().unwrap_or_else(PoisonError::into_inner));

        let mut stop = false;
        for entry in list {
            match entry {
                Some(work) => {
                    let _ = guard("deferred work", work);
                }
                None => stop = true,
            }
        }

        if stop {
            trace!("Work queue reached stop sentinel");
        }
        stop
    }

    /// Drop everything still queued without running it.
    pub fn reset(&self) {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .finish()
    }
}
