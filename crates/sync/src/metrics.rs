//! Internal counters for absorbed, non-fatal conditions
//!
//! Decode failures and stale-frame drops never surface as errors past
//! the provider boundary; they land here instead so operators can still
//! see them.

#![warn(missing_docs)]

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters updated by the channel and the ingestion task
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Frames accepted and merged into the state
    pub frames_applied: AtomicU64,
    /// Frames dropped as stale or duplicate
    pub stale_frames_dropped: AtomicU64,
    /// Inbound messages that failed to decode
    pub decode_errors: AtomicU64,
    /// Full-state resyncs applied
    pub resyncs_applied: AtomicU64,
    /// Snapshots published to subscribers
    pub snapshots_published: AtomicU64,
}

impl SyncMetrics {
    /// Increment one counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn read(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_applied: self.frames_applied.load(Ordering::Relaxed),
            stale_frames_dropped: self.stale_frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            resyncs_applied: self.resyncs_applied.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Frames accepted and merged into the state
    pub frames_applied: u64,
    /// Frames dropped as stale or duplicate
    pub stale_frames_dropped: u64,
    /// Inbound messages that failed to decode
    pub decode_errors: u64,
    /// Full-state resyncs applied
    pub resyncs_applied: u64,
    /// Snapshots published to subscribers
    pub snapshots_published: u64,
}
