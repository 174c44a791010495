//! Configuration surface of the sync core

#![warn(missing_docs)]

use std::env;

/// Recognized options for one provider instance
///
/// `Default` carries development values; `from_env` reads the
/// `GROUNDLINK_*` environment, requiring only the endpoint.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the telemetry source
    pub endpoint: String,
    /// Opaque bearer token supplied by the authentication layer
    pub auth_token: Option<String>,
    /// Reconnect attempts before the channel fails terminally
    pub max_reconnect_attempts: u32,
    /// First backoff delay in milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound on the backoff delay in milliseconds
    pub backoff_ceiling_ms: u64,
    /// Connected time after which the attempt counter resets
    pub stable_connection_ms: u64,
    /// Window without telemetry after which a connection is presumed
    /// dead (transport keepalives do not extend it)
    pub liveness_timeout_ms: u64,
    /// Bound of each immediate-mode subscription queue
    pub subscription_queue_depth: usize,
    /// Capacity of the per-asset recent-events ring
    pub event_ring_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9870/telemetry".to_string(),
            auth_token: None,
            max_reconnect_attempts: 10,
            backoff_base_ms: 250,
            backoff_ceiling_ms: 30_000,
            stable_connection_ms: 30_000,
            liveness_timeout_ms: 15_000,
            subscription_queue_depth: 32,
            event_ring_size: 64,
        }
    }
}

impl SyncConfig {
    /// Build a configuration from the `GROUNDLINK_*` environment
    ///
    /// `GROUNDLINK_ENDPOINT` is mandatory; every other option falls
    /// back to its default when unset or unparsable.
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Self::default();
        Ok(Self {
            endpoint: env::var("GROUNDLINK_ENDPOINT")?,
            auth_token: env::var("GROUNDLINK_AUTH_TOKEN").ok(),
            max_reconnect_attempts: env_or("GROUNDLINK_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            backoff_base_ms: env_or("GROUNDLINK_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_ceiling_ms: env_or("GROUNDLINK_BACKOFF_CEILING_MS", defaults.backoff_ceiling_ms),
            stable_connection_ms: env_or("GROUNDLINK_STABLE_CONNECTION_MS", defaults.stable_connection_ms),
            liveness_timeout_ms: env_or("GROUNDLINK_LIVENESS_TIMEOUT_MS", defaults.liveness_timeout_ms),
            subscription_queue_depth: env_or("GROUNDLINK_SUBSCRIPTION_QUEUE_DEPTH", defaults.subscription_queue_depth),
            event_ring_size: env_or("GROUNDLINK_EVENT_RING_SIZE", defaults.event_ring_size),
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
