//! Error types crossing the provider boundary
//!
//! Decode failures and stale frames never appear here: they are
//! absorbed into counters so consumers inside a rendering loop compose
//! with the core safely. Connectivity problems surface as
//! [`crate::types::ConnectionState`], not as panics.

#![warn(missing_docs)]

use thiserror::Error;

pub use crate::channel::ChannelError;
pub use crate::codec::DecodeError;

/// Errors surfaced by the telemetry provider
#[derive(Debug, Error)]
pub enum SyncError {
    /// Channel-level failure (invalid endpoint, rejected handshake)
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Provider already stopped
    #[error("Provider is stopped")]
    Stopped,
}

/// Result type for provider operations
pub type SyncResult<T> = Result<T, SyncError>;
