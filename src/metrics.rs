use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide counters, shared by the server, the sessions and the upstream link.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    replies: AtomicU64,
    stale_replies: AtomicU64,
    backpressure_waits: AtomicU64,
    abandoned: AtomicU64,
    active_sessions: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub requests: u64,
    pub replies: u64,
    pub stale_replies: u64,
    pub backpressure_waits: u64,
    pub abandoned: u64,
    pub active_sessions: usize,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn request_forwarded(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_delivered(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_dropped(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_wait(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_abandoned(&self, count: usize) {
        self.abandoned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            requests: self.requests.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} replies={} stale_replies={} backpressure_waits={} abandoned={} active_sessions={}",
            self.requests,
            self.replies,
            self.stale_replies,
            self.backpressure_waits,
            self.abandoned,
            self.active_sessions
        )
    }
}
