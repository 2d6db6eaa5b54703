//! Relay statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lock-free counters shared by the write path and every pump
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_stored: AtomicU64,
    frames_rejected: AtomicU64,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    ticks_absent: AtomicU64,
    codec_failures: AtomicU64,
    render_aborts: AtomicU64,
    viewers_started: AtomicU64,
    viewers_active: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stored(&self) {
        self.frames_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_absent(&self) {
        self.ticks_absent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codec_failure(&self) {
        self.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_abort(&self) {
        self.render_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a viewer as active until the returned guard is dropped
    pub fn viewer_guard(self: &Arc<Self>) -> ViewerGuard {
        self.viewers_started.fetch_add(1, Ordering::Relaxed);
        self.viewers_active.fetch_add(1, Ordering::Relaxed);
        ViewerGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn active_viewers(&self) -> u64 {
        self.viewers_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            frames_stored: self.frames_stored.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ticks_absent: self.ticks_absent.load(Ordering::Relaxed),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            render_aborts: self.render_aborts.load(Ordering::Relaxed),
            viewers_started: self.viewers_started.load(Ordering::Relaxed),
            viewers_active: self.viewers_active.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active viewer count on drop
#[derive(Debug)]
pub struct ViewerGuard {
    stats: Arc<RelayStats>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.stats.viewers_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub frames_stored: u64,
    pub frames_rejected: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub ticks_absent: u64,
    pub codec_failures: u64,
    /// Render tasks that panicked or were cancelled
    pub render_aborts: u64,
    pub viewers_started: u64,
    pub viewers_active: u64,
}

impl RelayStatsSnapshot {
    /// Chunk rate over `elapsed_secs` relative to an earlier snapshot
    pub fn chunks_per_sec(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let delta = self.chunks_sent.saturating_sub(previous.chunks_sent);
        delta as f64 / elapsed_secs
    }

    /// Outbound bitrate in kbps relative to an earlier snapshot
    pub fn bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_guard() {
        let stats = Arc::new(RelayStats::new());
        let a = stats.viewer_guard();
        let b = stats.viewer_guard();
        assert_eq!(stats.active_viewers(), 2);

        drop(a);
        assert_eq!(stats.active_viewers(), 1);
        drop(b);

        let snap = stats.snapshot();
        assert_eq!(snap.viewers_active, 0);
        assert_eq!(snap.viewers_started, 2);
    }

    #[test]
    fn test_record_chunk() {
        let stats = RelayStats::new();
        stats.record_chunk(100);
        stats.record_chunk(50);

        let snap = stats.snapshot();
        assert_eq!(snap.chunks_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
    }

    #[test]
    fn test_rates() {
        let prev = RelayStatsSnapshot {
            chunks_sent: 100,
            bytes_sent: 0,
            ..Default::default()
        };
        let current = RelayStatsSnapshot {
            chunks_sent: 130,
            bytes_sent: 125_000,
            ..Default::default()
        };

        assert_eq!(current.chunks_per_sec(&prev, 1.0), 30.0);
        assert_eq!(current.bitrate_kbps(&prev, 1.0), 1000.0);
        assert_eq!(current.chunks_per_sec(&prev, 0.0), 0.0);
    }
}
