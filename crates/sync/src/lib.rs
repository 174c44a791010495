//! Groundlink Sync
//!
//! Telemetry state-synchronization core for mission dashboards: owns
//! the live connection to the telemetry source, normalizes inbound
//! frames, maintains a coherent in-memory state model, and fans
//! immutable snapshots out to subscribers under explicit consistency
//! and backpressure rules.

#![warn(missing_docs)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod provider;
pub mod store;
pub mod types;

pub use channel::{ChannelError, ChannelEvent, IngestionChannel};
pub use codec::{decode, DecodeError, InboundMessage};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use hub::{SnapshotCallback, SubscriptionHandle, SubscriptionHub};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use provider::TelemetryProvider;
pub use store::StateStore;
pub use types::{
    AssetOperationalState, AssetState, ConnectionState, DeliveryMode, EventPayload, EventRecord,
    EventSeverity, FailureReason, FrameKind, FramePayload, KindSequences, PositionPayload,
    Snapshot, StatusPayload, TelemetryFrame, VitalsPayload,
};
