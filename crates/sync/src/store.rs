//! Authoritative state store producing immutable snapshots
//!
//! The store is the single owner of the mutable asset map. It is only
//! ever mutated from the provider's ingestion task, so it needs no
//! locking: every accepted change produces a fresh [`Snapshot`] behind
//! an `Arc`, and readers keep whatever snapshot they already hold.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::{AssetState, EventRecord, FrameKind, FramePayload, Snapshot, TelemetryFrame};

/// Single-writer store of the latest reconciled asset states
pub struct StateStore {
    current: Arc<Snapshot>,
    event_ring_size: usize,
}

impl StateStore {
    /// Create an empty store with the given recent-events ring capacity
    pub fn new(event_ring_size: usize) -> Self {
        Self {
            current: Snapshot::empty(),
            event_ring_size,
        }
    }

    /// The most recently published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current)
    }

    /// Apply one validated frame, publishing a new snapshot on change
    ///
    /// Returns `None` when the frame's sequence is not strictly greater
    /// than the stored floor for its `(asset, kind)` stream: replays and
    /// out-of-order frames are dropped whole, never merged, and the
    /// snapshot version does not move.
    pub fn apply(&mut self, frame: TelemetryFrame) -> Option<Arc<Snapshot>> {
        let floor = self
            .current
            .assets
            .get(&frame.asset_id)
            .map(|asset| asset.kind_sequences.get(frame.kind))
            .unwrap_or(0);

        if frame.sequence <= floor {
            debug!(
                asset_id = %frame.asset_id,
                kind = ?frame.kind,
                sequence = frame.sequence,
                floor = floor,
                "Dropping stale frame"
            );
            return None;
        }

        let mut assets = self.current.assets.clone();
        let asset = assets
            .entry(frame.asset_id.clone())
            .or_insert_with(|| AssetState::new(frame.asset_id.clone()));

        asset.kind_sequences.set(frame.kind, frame.sequence);
        asset.last_sequence = asset.kind_sequences.max();
        asset.last_updated_at = frame.timestamp;

        match frame.payload {
            FramePayload::Position(position) => asset.position = Some(position),
            FramePayload::Vitals(vitals) => asset.vitals = Some(vitals),
            FramePayload::Status(status) => asset.status = Some(status),
            FramePayload::Event(event) => {
                asset.recent_events.push_back(EventRecord {
                    sequence: frame.sequence,
                    timestamp: frame.timestamp,
                    severity: event.severity,
                    message: event.message,
                });
                while asset.recent_events.len() > self.event_ring_size {
                    asset.recent_events.pop_front();
                }
            }
        }

        Some(self.publish(assets))
    }

    /// Replace the entire asset set atomically from a resync payload
    ///
    /// Sequence floors come from the payload itself, so frames produced
    /// before the outage can no longer shadow the resynced state.
    pub fn apply_resync(&mut self, assets: Vec<AssetState>) -> Arc<Snapshot> {
        let mut map = HashMap::with_capacity(assets.len());
        for mut asset in assets {
            // Clamp inherited rings to our own bound.
            while asset.recent_events.len() > self.event_ring_size {
                asset.recent_events.pop_front();
            }
            map.insert(asset.asset_id.clone(), asset);
        }

        debug!(assets = map.len(), "Applying full-state resync");
        self.publish(map)
    }

    fn publish(&mut self, assets: HashMap<String, AssetState>) -> Arc<Snapshot> {
        let next = Arc::new(Snapshot {
            version: self.current.version + 1,
            assets,
        });
        self.current = Arc::clone(&next);
        next
    }
}
