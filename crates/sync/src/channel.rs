//! Ingestion channel owning the live telemetry connection
//!
//! Maintains exactly one logical WebSocket connection to the telemetry
//! source and exposes an ordered, restartable stream of decoded frames
//! and lifecycle events. Transport failures trigger jittered
//! exponential backoff; handshake rejection and malformed endpoints are
//! fatal and surfaced once through [`ConnectionState::Failed`].
//!
//! The channel never assumes server-side replay: after every successful
//! handshake it asks the source for a full-state resync, and the
//! resulting [`ChannelEvent::Resync`] lets the store reset its sequence
//! bookkeeping instead of rejecting post-outage frames as stale.

#![warn(missing_docs)]

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, Request, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::codec::{decode, InboundMessage};
use crate::config::SyncConfig;
use crate::metrics::SyncMetrics;
use crate::types::{AssetState, ConnectionState, FailureReason, TelemetryFrame};

/// Capacity of the decoded-event queue between channel and owner
const EVENT_QUEUE_DEPTH: usize = 256;

/// Errors the channel can surface to its owner
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Handshake rejected by the source; not retryable
    #[error("Handshake rejected: unauthorized")]
    Unauthorized,

    /// Endpoint could not be turned into a connect request
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Underlying transport failure; retryable via backoff
    #[error("Transport error: {0}")]
    Transport(#[from] WsError),

    /// Reconnect budget exhausted
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    AttemptsExhausted {
        /// Number of attempts made
        attempts: u32,
    },
}

/// One event emitted by the channel to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A decoded incremental telemetry frame
    Frame(TelemetryFrame),
    /// Full-state replacement received after a (re)connect
    Resync(Vec<AssetState>),
    /// Connection lifecycle transition
    Lifecycle(ConnectionState),
}

/// Why a live connection ended
enum SessionEnd {
    /// Owner requested shutdown
    Shutdown,
    /// Transport dropped, timed out, or closed
    Disconnected,
    /// Event receiver went away; owner is gone
    ReceiverGone,
}

/// Handle to the running ingestion task
pub struct IngestionChannel {
    events: mpsc::Receiver<ChannelEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl IngestionChannel {
    /// Spawn the channel task and begin connecting
    pub fn spawn(config: SyncConfig, metrics: Arc<SyncMetrics>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(config, events_tx, state_tx, shutdown_rx, metrics));

        Self {
            events: events_rx,
            state_rx,
            shutdown: Arc::new(shutdown_tx),
            task,
        }
    }

    /// Next decoded frame or lifecycle event; `None` once the channel
    /// task has exited and the queue is drained
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver for connection-state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Handle that lets the owner request shutdown without holding the
    /// channel itself
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    /// Request shutdown and wait for the channel task to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Validate the configured endpoint and build the handshake request,
/// attaching the bearer token when one is configured
pub(crate) fn build_request(config: &SyncConfig) -> Result<Request<()>, ChannelError> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| ChannelError::InvalidEndpoint(err.to_string()))?;

    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ChannelError::InvalidEndpoint(err.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    Ok(request)
}

/// Raw exponential backoff delay for a 1-based attempt, capped at the
/// ceiling
pub(crate) fn backoff_delay_ms(attempt: u32, base_ms: u64, ceiling_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    base_ms
        .saturating_mul(1u64 << exponent)
        .min(ceiling_ms.max(base_ms))
}

/// Apply jitter: the result stays within `[delay/2, delay]` so herds of
/// reconnecting clients spread out without collapsing the schedule
pub(crate) fn with_jitter(delay_ms: u64, rng: &mut impl Rng) -> u64 {
    let half = delay_ms / 2;
    half + rng.gen_range(0..=delay_ms.saturating_sub(half))
}

fn classify_connect_error(err: WsError) -> ChannelError {
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ChannelError::Unauthorized
        }
        WsError::Url(err) => ChannelError::InvalidEndpoint(err.to_string()),
        other => ChannelError::Transport(other),
    }
}

/// Publish a lifecycle transition through both the state watch and the
/// event stream. Returns false once the owner is gone.
async fn transition(
    state_tx: &watch::Sender<ConnectionState>,
    events: &mpsc::Sender<ChannelEvent>,
    state: ConnectionState,
) -> bool {
    let _ = state_tx.send(state.clone());
    events.send(ChannelEvent::Lifecycle(state)).await.is_ok()
}

/// Channel main loop: `Idle -> Connecting -> Connected <-> Backoff ->
/// ... -> Failed`
async fn run(
    config: SyncConfig,
    events: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<SyncMetrics>,
) {
    let stable_after = Duration::from_millis(config.stable_connection_ms);
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            let _ = transition(
                &state_tx,
                &events,
                ConnectionState::Failed {
                    reason: FailureReason::Shutdown,
                },
            )
            .await;
            return;
        }

        if !transition(&state_tx, &events, ConnectionState::Connecting).await {
            return;
        }

        let request = match build_request(&config) {
            Ok(request) => request,
            Err(err) => {
                error!(endpoint = %config.endpoint, error = %err, "Endpoint rejected");
                let _ = transition(
                    &state_tx,
                    &events,
                    ConnectionState::Failed {
                        reason: FailureReason::InvalidEndpoint,
                    },
                )
                .await;
                return;
            }
        };

        match connect_async(request).await {
            Ok((ws, _response)) => {
                info!(endpoint = %config.endpoint, "Telemetry link established");
                if !transition(&state_tx, &events, ConnectionState::Connected).await {
                    return;
                }

                let connected_at = Instant::now();
                let end = run_session(ws, &config, &events, &mut shutdown_rx, &metrics).await;

                match end {
                    SessionEnd::Shutdown => {
                        let _ = transition(
                            &state_tx,
                            &events,
                            ConnectionState::Failed {
                                reason: FailureReason::Shutdown,
                            },
                        )
                        .await;
                        return;
                    }
                    SessionEnd::ReceiverGone => return,
                    SessionEnd::Disconnected => {
                        // A connection that held long enough earns a
                        // fresh attempt budget; one that died right
                        // after reconnecting does not.
                        if connected_at.elapsed() >= stable_after {
                            attempt = 0;
                        }
                    }
                }
            }
            Err(err) => match classify_connect_error(err) {
                ChannelError::Unauthorized => {
                    error!(endpoint = %config.endpoint, "Handshake rejected, not retrying");
                    let _ = transition(
                        &state_tx,
                        &events,
                        ConnectionState::Failed {
                            reason: FailureReason::Unauthorized,
                        },
                    )
                    .await;
                    return;
                }
                ChannelError::InvalidEndpoint(reason) => {
                    error!(endpoint = %config.endpoint, reason = %reason, "Endpoint rejected");
                    let _ = transition(
                        &state_tx,
                        &events,
                        ConnectionState::Failed {
                            reason: FailureReason::InvalidEndpoint,
                        },
                    )
                    .await;
                    return;
                }
                other => {
                    warn!(endpoint = %config.endpoint, error = %other, "Connect failed");
                }
            },
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            let err = ChannelError::AttemptsExhausted {
                attempts: attempt - 1,
            };
            error!(error = %err, "Giving up on reconnecting");
            let _ = transition(
                &state_tx,
                &events,
                ConnectionState::Failed {
                    reason: FailureReason::AttemptsExhausted,
                },
            )
            .await;
            return;
        }

        let delay_ms = with_jitter(
            backoff_delay_ms(attempt, config.backoff_base_ms, config.backoff_ceiling_ms),
            &mut rand::thread_rng(),
        );
        debug!(attempt, delay_ms, "Backing off before reconnect");
        if !transition(
            &state_tx,
            &events,
            ConnectionState::Backoff {
                attempt,
                next_retry_ms: delay_ms,
            },
        )
        .await
        {
            return;
        }

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            changed = shutdown_rx.changed() => {
                // A dropped shutdown handle means the owner is gone.
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drive one live connection until it ends
async fn run_session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &SyncConfig,
    events: &mpsc::Sender<ChannelEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
    metrics: &SyncMetrics,
) -> SessionEnd {
    let (mut sender, mut receiver) = ws.split();
    let liveness = Duration::from_millis(config.liveness_timeout_ms);

    // Never assume server-side replay across an outage: ask for the
    // full current state and let the resync supersede stale sequences.
    let resync_request = serde_json::json!({ "type": "resync_request" }).to_string();
    if let Err(err) = sender.send(Message::Text(resync_request)).await {
        warn!(error = %err, "Failed to request resync");
        return SessionEnd::Disconnected;
    }

    // Only telemetry extends the liveness window; transport keepalives
    // do not count as proof the source is still producing.
    let mut deadline = Instant::now() + liveness;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = sender.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
            inbound = timeout_at(deadline, receiver.next()) => {
                let message = match inbound {
                    // No telemetry inside the liveness window: a silent
                    // link is treated as failed, not assumed healthy.
                    Err(_elapsed) => {
                        warn!(timeout_ms = config.liveness_timeout_ms, "Liveness window expired");
                        return SessionEnd::Disconnected;
                    }
                    Ok(None) => return SessionEnd::Disconnected,
                    Ok(Some(Err(err))) => {
                        warn!(error = %err, "Transport receive error");
                        return SessionEnd::Disconnected;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => {
                        deadline = Instant::now() + liveness;
                        if !forward_decoded(&text, events, metrics).await {
                            return SessionEnd::ReceiverGone;
                        }
                    }
                    Message::Binary(bytes) => {
                        deadline = Instant::now() + liveness;
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => {
                                if !forward_decoded(text, events, metrics).await {
                                    return SessionEnd::ReceiverGone;
                                }
                            }
                            Err(_) => {
                                SyncMetrics::incr(&metrics.decode_errors);
                                warn!("Discarding non-UTF-8 binary frame");
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Source closed the connection");
                        return SessionEnd::Disconnected;
                    }
                    // Answered by the transport layer; the liveness
                    // deadline stands.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Decode one message and forward it; decode failures are absorbed
/// (counted and logged), they never terminate the session
async fn forward_decoded(
    text: &str,
    events: &mpsc::Sender<ChannelEvent>,
    metrics: &SyncMetrics,
) -> bool {
    match decode(text) {
        Ok(InboundMessage::Frame(frame)) => events.send(ChannelEvent::Frame(frame)).await.is_ok(),
        Ok(InboundMessage::Resync(assets)) => {
            info!(assets = assets.len(), "Resync received");
            events.send(ChannelEvent::Resync(assets)).await.is_ok()
        }
        Err(err) => {
            SyncMetrics::incr(&metrics.decode_errors);
            warn!(error = %err, "Skipping undecodable frame");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_backoff_schedule_monotone_until_ceiling() {
        let base = 250;
        let ceiling = 30_000;
        let mut previous = 0;

        for attempt in 1..=12 {
            let delay = backoff_delay_ms(attempt, base, ceiling);
            assert!(delay >= previous, "attempt {attempt} regressed");
            assert!(delay <= ceiling);
            previous = delay;
        }

        assert_eq!(backoff_delay_ms(1, base, ceiling), 250);
        assert_eq!(backoff_delay_ms(2, base, ceiling), 500);
        assert_eq!(backoff_delay_ms(3, base, ceiling), 1_000);
        assert_eq!(backoff_delay_ms(12, base, ceiling), 30_000);
    }

    #[test]
    fn test_backoff_no_overflow_on_large_attempts() {
        let delay = backoff_delay_ms(u32::MAX, 250, 30_000);
        assert_eq!(delay, 30_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut rng = StepRng::new(0, 0x9E37_79B9_7F4A_7C15);
        for _ in 0..100 {
            let jittered = with_jitter(1_000, &mut rng);
            assert!(jittered >= 500 && jittered <= 1_000, "out of range: {jittered}");
        }
    }

    #[test]
    fn test_build_request_attaches_bearer_token() {
        let config = SyncConfig {
            endpoint: "ws://127.0.0.1:9870/telemetry".to_string(),
            auth_token: Some("opaque-token".to_string()),
            ..SyncConfig::default()
        };

        let request = build_request(&config).expect("valid endpoint");
        let auth = request
            .headers()
            .get(header::AUTHORIZATION)
            .expect("authorization header");
        assert_eq!(auth.to_str().unwrap(), "Bearer opaque-token");
    }

    #[test]
    fn test_build_request_rejects_bad_endpoint() {
        let config = SyncConfig {
            endpoint: "not a url".to_string(),
            ..SyncConfig::default()
        };

        assert!(matches!(
            build_request(&config),
            Err(ChannelError::InvalidEndpoint(_))
        ));
    }
}
