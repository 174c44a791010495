//! Telemetry frame and asset-state types shared across the sync core
//!
//! This module defines the wire-facing frame types, the reconciled
//! per-asset state, and the immutable versioned snapshot handed to
//! consumers.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Telemetry frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Trajectory/position update
    Position,
    /// Platform vitals (power, thermal, link)
    Vitals,
    /// Operational status change
    Status,
    /// Discrete asset event
    Event,
}

/// Position payload carrying the trajectory fields of one update
///
/// Only `x`/`y`/`z` are mandatory; the source may attach derived
/// trajectory data (velocity vector and scalar, geodetic coordinates)
/// when its propagator has them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionPayload {
    /// Position X in the source reference frame (km)
    pub x: f64,
    /// Position Y in the source reference frame (km)
    pub y: f64,
    /// Position Z in the source reference frame (km)
    pub z: f64,
    /// Velocity X component (km/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    /// Velocity Y component (km/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    /// Velocity Z component (km/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vz: Option<f64>,
    /// Scalar velocity (km/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    /// Sub-satellite latitude in decimal degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Sub-satellite longitude in decimal degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Altitude above the reference ellipsoid (km)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

/// Vitals payload for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VitalsPayload {
    /// Battery charge percentage (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    /// Bus temperature in Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
    /// Downlink signal strength in dB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_db: Option<f32>,
}

/// Operational state reported by an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOperationalState {
    /// Operating within parameters
    Nominal,
    /// Operating with reduced capability
    Degraded,
    /// In safe mode awaiting operator action
    Safe,
    /// Not reachable
    Offline,
    /// State unknown or not yet reported
    Unknown,
}

/// Status payload for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusPayload {
    /// Reported operational state
    pub state: AssetOperationalState,
    /// Optional free-form detail from the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// Informational event
    Info,
    /// Anomaly requiring attention
    Warning,
    /// Critical fault
    Critical,
}

/// Event payload for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventPayload {
    /// Event severity
    pub severity: EventSeverity,
    /// Human-readable event message
    pub message: String,
}

/// Typed payload, variant-by-kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FramePayload {
    /// Payload of a [`FrameKind::Position`] frame
    Position(PositionPayload),
    /// Payload of a [`FrameKind::Vitals`] frame
    Vitals(VitalsPayload),
    /// Payload of a [`FrameKind::Status`] frame
    Status(StatusPayload),
    /// Payload of a [`FrameKind::Event`] frame
    Event(EventPayload),
}

/// One atomic telemetry update for one asset and one data kind
///
/// Immutable once constructed. `sequence` is strictly increasing per
/// `(asset_id, kind)` as produced by the source and is the sole
/// ordering key; `timestamp` is advisory only since the source may
/// batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Asset identifier
    #[serde(rename = "assetId")]
    pub asset_id: String,
    /// Per-(asset, kind) monotonic sequence number
    pub sequence: u64,
    /// Monotonic source time
    #[serde(rename = "ts")]
    pub timestamp: u64,
    /// Frame kind
    pub kind: FrameKind,
    /// Typed payload matching `kind`
    pub payload: FramePayload,
}

/// One entry of the bounded recent-events ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Sequence of the originating event frame
    pub sequence: u64,
    /// Source timestamp of the event
    pub timestamp: u64,
    /// Event severity
    pub severity: EventSeverity,
    /// Event message
    pub message: String,
}

/// Highest applied sequence per frame kind for one asset
///
/// Each kind is an independent monotonic stream so a stalled kind never
/// blocks the others. Zero means "no frame of that kind applied yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSequences {
    /// Highest applied position sequence
    pub position: u64,
    /// Highest applied vitals sequence
    pub vitals: u64,
    /// Highest applied status sequence
    pub status: u64,
    /// Highest applied event sequence
    pub event: u64,
}

impl KindSequences {
    /// Highest applied sequence for `kind`
    pub fn get(&self, kind: FrameKind) -> u64 {
        match kind {
            FrameKind::Position => self.position,
            FrameKind::Vitals => self.vitals,
            FrameKind::Status => self.status,
            FrameKind::Event => self.event,
        }
    }

    /// Record `sequence` as the highest applied for `kind`
    pub fn set(&mut self, kind: FrameKind, sequence: u64) {
        match kind {
            FrameKind::Position => self.position = sequence,
            FrameKind::Vitals => self.vitals = sequence,
            FrameKind::Status => self.status = sequence,
            FrameKind::Event => self.event = sequence,
        }
    }

    /// Highest applied sequence across all kinds
    pub fn max(&self) -> u64 {
        self.position
            .max(self.vitals)
            .max(self.status)
            .max(self.event)
    }
}

/// Latest reconciled state for one asset
///
/// Fields are updated independently: a position frame touches only the
/// position field, leaving vitals and status as last reported. Owned
/// exclusively by the state store; consumers only ever see it inside an
/// immutable [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetState {
    /// Asset identifier
    #[serde(rename = "assetId")]
    pub asset_id: String,
    /// Highest sequence applied across all kinds (diagnostic)
    #[serde(rename = "lastSequence")]
    pub last_sequence: u64,
    /// Source timestamp of the last applied frame
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: u64,
    /// Per-kind sequence floors
    #[serde(rename = "kindSequences", default)]
    pub kind_sequences: KindSequences,
    /// Latest position, if any position frame has been applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionPayload>,
    /// Latest vitals, if any vitals frame has been applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vitals: Option<VitalsPayload>,
    /// Latest status, if any status frame has been applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusPayload>,
    /// Bounded ring of recent events, oldest first
    #[serde(rename = "recentEvents", default)]
    pub recent_events: VecDeque<EventRecord>,
}

impl AssetState {
    /// Create an empty state for `asset_id`
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            last_sequence: 0,
            last_updated_at: 0,
            kind_sequences: KindSequences::default(),
            position: None,
            vitals: None,
            status: None,
            recent_events: VecDeque::new(),
        }
    }

    /// Check if the asset has not reported within `threshold_ms`
    pub fn is_stale(&self, current_time_ms: u64, threshold_ms: u64) -> bool {
        if current_time_ms < self.last_updated_at {
            return false; // Clock skew - don't mark as stale
        }
        (current_time_ms - self.last_updated_at) > threshold_ms
    }
}

/// Immutable, versioned full picture of all assets' latest known state
///
/// Never mutated after publication: the state store always produces a
/// new snapshot on change, so sharing `Arc<Snapshot>` across tasks needs
/// no locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonically increasing publication counter
    pub version: u64,
    /// Latest reconciled state per asset
    pub assets: HashMap<String, AssetState>,
}

impl Snapshot {
    /// The empty snapshot, version zero
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            version: 0,
            assets: HashMap::new(),
        })
    }

    /// State for one asset, if known
    pub fn asset(&self, asset_id: &str) -> Option<&AssetState> {
        self.assets.get(asset_id)
    }

    /// Number of known assets
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// True if no assets are known
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Reason a channel reached the terminal `Failed` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Handshake rejected by the source (non-retryable)
    Unauthorized,
    /// Reconnect attempts budget exhausted
    AttemptsExhausted,
    /// Endpoint could not be parsed into a connect request
    InvalidEndpoint,
    /// Explicit shutdown requested by the owner
    Shutdown,
}

/// Connection lifecycle state of the ingestion channel
///
/// Observable by consumers (for connectivity widgets), mutable only by
/// the channel itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    /// Channel created, not yet started
    Idle,
    /// Transport handshake in progress
    Connecting,
    /// Live connection established
    Connected,
    /// Waiting before the next reconnect attempt
    Backoff {
        /// Reconnect attempt number (1-based)
        attempt: u32,
        /// Delay before the next attempt in milliseconds
        next_retry_ms: u64,
    },
    /// Terminal failure
    Failed {
        /// Why the channel gave up
        reason: FailureReason,
    },
}

/// How snapshots are delivered to one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Every snapshot, in publication order, queued while the consumer
    /// is mid-callback
    Immediate,
    /// At most one snapshot per interval tick, always the latest
    Coalesced {
        /// Tick interval in milliseconds
        interval_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sequences_independent() {
        let mut seqs = KindSequences::default();
        seqs.set(FrameKind::Position, 7);
        seqs.set(FrameKind::Vitals, 3);

        assert_eq!(seqs.get(FrameKind::Position), 7);
        assert_eq!(seqs.get(FrameKind::Vitals), 3);
        assert_eq!(seqs.get(FrameKind::Status), 0);
        assert_eq!(seqs.max(), 7);
    }

    #[test]
    fn test_asset_state_stale_detection() {
        let mut state = AssetState::new("sat-1");
        state.last_updated_at = 10_000;

        assert!(!state.is_stale(10_000, 30_000));
        assert!(!state.is_stale(40_000, 30_000));
        assert!(state.is_stale(40_001, 30_000));

        // Clock skew - never stale
        assert!(!state.is_stale(5_000, 30_000));
    }

    #[test]
    fn test_frame_wire_roundtrip() {
        let raw = r#"{
            "assetId": "sat-1",
            "sequence": 42,
            "ts": 1700000000000,
            "kind": "position",
            "payload": {"x": 1.0, "y": 2.0, "z": 3.0, "velocity": 7.5}
        }"#;

        let frame: TelemetryFrame = serde_json::from_str(raw).expect("valid frame");
        assert_eq!(frame.asset_id, "sat-1");
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.kind, FrameKind::Position);
        match &frame.payload {
            FramePayload::Position(p) => {
                assert_eq!(p.x, 1.0);
                assert_eq!(p.velocity, Some(7.5));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
