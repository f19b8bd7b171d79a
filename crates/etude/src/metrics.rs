// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide engine counters, shared by every worker.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct EngineMetrics {
    pub active_conns: AtomicUsize,
    pub accepted_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub bad_requests: AtomicUsize,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub accepted_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub bad_requests: usize,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            accepted_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            bad_requests: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.accepted_conns.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            accepted_conns: self.accepted_conns.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge_and_counters() {
        let metrics = EngineMetrics::new();
        metrics.inc_conn();
        metrics.inc_conn();
        metrics.dec_conn();
        metrics.inc_req();
        metrics.add_bytes(128);
        metrics.inc_bad_request();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.accepted_conns, 2);
        assert_eq!(snap.req_count, 1);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.bad_requests, 1);
    }

    #[test]
    fn test_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<EngineMetrics>(), 64);
    }
}
