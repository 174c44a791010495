//! Synthetic telemetry feed for exercising the sync core
//!
//! Serves a WebSocket endpoint that pushes generated satellite frames
//! at a configurable rate, answers `resync_request` with the current
//! full state, and can optionally run a provider against itself
//! (`LINK_SIM_SELF_TEST=1`) to demonstrate the consumer contract.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

use groundlink_sync::{
    AssetOperationalState, DeliveryMode, EventPayload, EventSeverity, FrameKind, FramePayload,
    PositionPayload, Snapshot, StateStore, StatusPayload, SyncConfig, TelemetryFrame,
    TelemetryProvider, VitalsPayload,
};

#[derive(Clone)]
struct Config {
    port: u16,
    asset_count: usize,
    rate_hz: u64,
    self_test: bool,
}

impl Config {
    fn from_env() -> Self {
        Config {
            port: env_or("LINK_SIM_PORT", 9870),
            asset_count: env_or("LINK_SIM_ASSETS", 4),
            rate_hz: env_or("LINK_SIM_RATE_HZ", 10),
            self_test: env::var("LINK_SIM_SELF_TEST").map(|v| v == "1").unwrap_or(false),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, assets = config.asset_count, rate_hz = config.rate_hz,
          "Link simulator listening");

    let (frames_tx, _) = broadcast::channel::<String>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty());

    tokio::spawn(generate_feed(config.clone(), frames_tx.clone(), snapshot_tx));

    if config.self_test {
        tokio::spawn(run_self_test(config.port));
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!(peer = %peer_addr, "Feed client connected");
                let frames_rx = frames_tx.subscribe();
                let snapshot_rx = snapshot_rx.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_client(stream, frames_rx, snapshot_rx).await {
                        warn!(peer = %peer_addr, error = %err, "Feed client ended");
                    }
                });
            }
            Err(err) => error!(error = %err, "Accept failed"),
        }
    }
}

/// Generate frames for all simulated assets at the configured rate
///
/// The simulator dogfoods the sync core's own state store so resync
/// replies always reflect exactly what was already broadcast.
async fn generate_feed(
    config: Config,
    frames_tx: broadcast::Sender<String>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
) {
    let mut store = StateStore::new(32);
    let period_ms = (1_000 / config.rate_hz.max(1)).max(1);
    let mut ticker = interval(Duration::from_millis(period_ms));
    let mut tick: u64 = 0;

    loop {
        ticker.tick().await;
        tick += 1;

        for index in 0..config.asset_count {
            let asset_id = format!("sat-{index}");
            let frame = synthesize_frame(&asset_id, index, tick);
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    error!(error = %err, "Frame serialization failed");
                    continue;
                }
            };

            if store.apply(frame).is_some() {
                let _ = snapshot_tx.send(store.snapshot());
            }
            // No receivers is fine; clients come and go.
            let _ = frames_tx.send(text);
        }
    }
}

/// One frame per asset per tick: mostly positions, vitals every second,
/// a status or event now and then
fn synthesize_frame(asset_id: &str, index: usize, tick: u64) -> TelemetryFrame {
    let mut rng = rand::thread_rng();
    let phase = index as f64 * 0.7;
    let theta = tick as f64 * 0.01 + phase;
    let radius = 7_000.0 + index as f64 * 150.0;

    let (kind, payload) = if tick % 100 == index as u64 % 100 {
        (
            FrameKind::Event,
            FramePayload::Event(EventPayload {
                severity: EventSeverity::Info,
                message: format!("station pass {tick}"),
            }),
        )
    } else if tick % 50 == 0 {
        (
            FrameKind::Status,
            FramePayload::Status(StatusPayload {
                state: AssetOperationalState::Nominal,
                detail: None,
            }),
        )
    } else if tick % 10 == 0 {
        (
            FrameKind::Vitals,
            FramePayload::Vitals(VitalsPayload {
                battery_percent: Some(100.0 - (tick % 5_000) as f32 * 0.01),
                temperature_c: Some(21.0 + rng.gen_range(-2.0..2.0)),
                signal_db: Some(-92.0 + rng.gen_range(-3.0..3.0)),
            }),
        )
    } else {
        (
            FrameKind::Position,
            FramePayload::Position(PositionPayload {
                x: radius * theta.cos(),
                y: radius * theta.sin(),
                z: 400.0 * (theta * 0.3).sin(),
                vx: None,
                vy: None,
                vz: None,
                velocity: Some(7.5 + rng.gen_range(-0.05..0.05)),
                lat: Some((theta.sin() * 51.6).clamp(-90.0, 90.0)),
                lon: Some(((theta * 57.3) % 360.0) - 180.0),
                alt: Some(420.0 + rng.gen_range(-1.0..1.0)),
            }),
        )
    };

    // Per-kind sequences all advance with the tick counter, which keeps
    // them strictly increasing within each kind stream.
    TelemetryFrame {
        asset_id: asset_id.to_string(),
        sequence: tick,
        timestamp: now_ms(),
        kind,
        payload,
    }
}

/// Serve one feed client: forward broadcast frames, answer resync
/// requests with the current full state
async fn serve_client(
    stream: TcpStream,
    mut frames_rx: broadcast::Receiver<String>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut sender, mut receiver) = ws.split();

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) if text.contains("resync_request") => {
                        let snapshot = snapshot_rx.borrow().clone();
                        let assets: Vec<_> = snapshot.assets.values().cloned().collect();
                        let reply = serde_json::json!({ "type": "resync", "assets": assets });
                        sender.send(Message::Text(reply.to_string())).await?;
                        info!(assets = assets_len(&reply), "Resync served");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(_)) => {}
                }
            }
            frame = frames_rx.recv() => {
                match frame {
                    Ok(text) => sender.send(Message::Text(text)).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Slow feed client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn assets_len(reply: &serde_json::Value) -> usize {
    reply
        .get("assets")
        .and_then(|assets| assets.as_array())
        .map(|assets| assets.len())
        .unwrap_or(0)
}

/// Run a provider against our own feed and log what a consumer sees
async fn run_self_test(port: u16) {
    let provider = match TelemetryProvider::start(SyncConfig {
        endpoint: format!("ws://127.0.0.1:{port}/telemetry"),
        ..SyncConfig::default()
    }) {
        Ok(provider) => provider,
        Err(err) => {
            error!(error = %err, "Self-test provider failed to start");
            return;
        }
    };

    let _handle = provider.subscribe(DeliveryMode::Coalesced { interval_ms: 500 }, |snapshot| {
        info!(
            version = snapshot.version,
            assets = snapshot.len(),
            "Self-test snapshot"
        );
    });

    // Keep the provider (and its subscription) alive for the process
    // lifetime.
    std::future::pending::<()>().await;
}
