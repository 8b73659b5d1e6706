//! Observability and Metrics
//!
//! Atomic counters describing session and request activity. Each hub owns
//! one [`Metrics`] instance; sessions, servers and clients built on that hub
//! report into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one hub.
#[derive(Debug)]
pub struct Metrics {
    /// Sessions ever created
    pub sessions_opened: AtomicU64,
    /// Sessions not yet terminated
    pub sessions_active: AtomicU64,
    /// Frames decoded by reader loops
    pub frames_received: AtomicU64,
    /// Payloads written by writer loops
    pub frames_sent: AtomicU64,
    /// Bytes decoded (header included)
    pub bytes_received: AtomicU64,
    /// Bytes written
    pub bytes_sent: AtomicU64,
    /// Handler invocations that panicked
    pub handler_panics: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
    /// Frames with no handler and no fallback
    pub unregistered_frames: AtomicU64,
    /// Client requests that timed out
    pub request_timeouts: AtomicU64,
    /// Successful client re-dials
    pub reconnects: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            unregistered_frames: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_terminated(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregistered_frame(&self) {
        self.unregistered_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            unregistered_frames: self.unregistered_frames.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            sessions_opened = snapshot.sessions_opened,
            sessions_active = snapshot.sessions_active,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            handler_panics = snapshot.handler_panics,
            handler_errors = snapshot.handler_errors,
            unregistered_frames = snapshot.unregistered_frames,
            request_timeouts = snapshot.request_timeouts,
            reconnects = snapshot.reconnects,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub handler_panics: u64,
    pub handler_errors: u64,
    pub unregistered_frames: u64,
    pub request_timeouts: u64,
    pub reconnects: u64,
    pub uptime_seconds: u64,
}
