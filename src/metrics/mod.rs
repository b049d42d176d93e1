//! Process-wide counters and gauges exported at `/api/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Live metric registers. Counters only ever increase; gauges track the
/// session manager's view of the world.
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_rejected: AtomicU64,
    active_sessions: AtomicU64,
    bytes_relayed: AtomicU64,
    epg_ingest_ok: AtomicU64,
    epg_ingest_failed: AtomicU64,
}

/// Point-in-time serializable copy of [`Metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_rejected: u64,
    pub active_sessions: u64,
    pub bytes_relayed: u64,
    pub epg_ingest_ok: u64,
    pub epg_ingest_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            epg_ingest_ok: AtomicU64::new(0),
            epg_ingest_failed: AtomicU64::new(0),
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        // Saturating: a double decrement is a bug elsewhere, never an underflow here.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_relayed(&self, n: u64) {
        self.bytes_relayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn epg_ingest_succeeded(&self) {
        self.epg_ingest_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn epg_ingest_failed(&self) {
        self.epg_ingest_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            epg_ingest_ok: self.epg_ingest_ok.load(Ordering::Relaxed),
            epg_ingest_failed: self.epg_ingest_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle_counters() {
        let metrics = Metrics::new();
        metrics.session_started();
        metrics.session_started();
        assert_eq!(metrics.active_sessions(), 2);

        metrics.session_completed();
        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_started, 2);
        assert_eq!(snap.sessions_completed, 1);
        assert_eq!(snap.active_sessions, 1);
    }

    #[test]
    fn test_active_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.session_completed();
        assert_eq!(metrics.active_sessions(), 0);
    }

    #[test]
    fn test_bytes_accumulate() {
        let metrics = Metrics::new();
        metrics.add_bytes_relayed(1024);
        metrics.add_bytes_relayed(512);
        assert_eq!(metrics.snapshot().bytes_relayed, 1536);
    }
}
