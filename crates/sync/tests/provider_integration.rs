//! End-to-end provider tests against an in-process WebSocket source

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

use groundlink_sync::{
    ChannelEvent, ConnectionState, DeliveryMode, FailureReason, IngestionChannel, SyncConfig,
    SyncMetrics, TelemetryProvider,
};

async fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Read messages until the client's resync request arrives
async fn await_resync_request(ws: &mut WebSocketStream<TcpStream>) {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            if text.contains("resync_request") {
                return;
            }
        }
    }
    panic!("connection ended before resync request");
}

fn frame(asset: &str, sequence: u64, kind: &str, payload: serde_json::Value) -> Message {
    Message::Text(
        json!({
            "assetId": asset,
            "sequence": sequence,
            "ts": 1_700_000_000_000u64 + sequence,
            "kind": kind,
            "payload": payload,
        })
        .to_string(),
    )
}

#[tokio::test]
async fn provider_converges_and_resyncs_after_outage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Session one: resync, a few frames (including a replay and an
        // undecodable message), then an abrupt drop.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;

        ws.send(Message::Text(
            json!({ "type": "resync", "assets": [] }).to_string(),
        ))
        .await
        .unwrap();

        ws.send(frame("sat-1", 1, "position", json!({"x": 0.0, "y": 0.0, "z": 0.0})))
            .await
            .unwrap();
        ws.send(frame("sat-1", 2, "vitals", json!({"battery_percent": 92.0})))
            .await
            .unwrap();
        // Replay of position sequence 1 with different values: must be
        // dropped whole.
        ws.send(frame("sat-1", 1, "position", json!({"x": 9.0, "y": 9.0, "z": 9.0})))
            .await
            .unwrap();
        // Unknown kind: skipped, never fatal.
        ws.send(frame("sat-1", 3, "thermal", json!({})))
            .await
            .unwrap();
        drop(ws);

        // Session two after the client's backoff: only the resync
        // payload defines the world now.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;

        ws.send(Message::Text(
            json!({
                "type": "resync",
                "assets": [{
                    "assetId": "sat-9",
                    "lastSequence": 2,
                    "lastUpdatedAt": 1_700_000_000_500u64,
                    "kindSequences": {"position": 2, "vitals": 0, "status": 0, "event": 0},
                    "position": {"x": 7.0, "y": 8.0, "z": 9.0}
                }]
            })
            .to_string(),
        ))
        .await
        .unwrap();

        // A post-resync frame with a low sequence: acceptable because
        // the resync reset the floors.
        ws.send(frame("sat-9", 3, "position", json!({"x": 10.0, "y": 8.0, "z": 9.0})))
            .await
            .unwrap();

        // Hold the connection open until the client is done.
        while ws.next().await.is_some() {}
    });

    let provider = TelemetryProvider::start(SyncConfig {
        endpoint: format!("ws://{addr}/telemetry"),
        max_reconnect_attempts: 20,
        backoff_base_ms: 20,
        backoff_ceiling_ms: 100,
        liveness_timeout_ms: 60_000,
        ..SyncConfig::default()
    })
    .expect("valid config");

    let versions: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&versions);
    let handle = provider.subscribe(DeliveryMode::Immediate, move |snapshot| {
        sink.lock().unwrap().push(snapshot.version);
    });

    // Phase one: both frames merged, replay dropped, decode error
    // absorbed.
    wait_until(
        || {
            let snapshot = provider.snapshot();
            snapshot
                .asset("sat-1")
                .and_then(|asset| asset.vitals.as_ref())
                .is_some()
        },
        "sat-1 vitals",
    )
    .await;

    let snapshot = provider.snapshot();
    let sat1 = snapshot.asset("sat-1").unwrap();
    assert_eq!(sat1.position.as_ref().unwrap().x, 0.0);
    assert_eq!(sat1.vitals.as_ref().unwrap().battery_percent, Some(92.0));

    wait_until(
        || provider.metrics().stale_frames_dropped == 1,
        "stale frame counter",
    )
    .await;
    wait_until(|| provider.metrics().decode_errors == 1, "decode counter").await;

    // Phase two: the outage and the second resync. The snapshot must
    // reflect only the resync payload, plus the post-resync frame.
    wait_until(
        || {
            let snapshot = provider.snapshot();
            snapshot
                .asset("sat-9")
                .and_then(|asset| asset.position.as_ref())
                .map(|position| position.x == 10.0)
                .unwrap_or(false)
        },
        "post-resync state",
    )
    .await;

    let snapshot = provider.snapshot();
    assert!(snapshot.asset("sat-1").is_none(), "pre-outage state must be gone");
    assert_eq!(provider.metrics().resyncs_applied, 2);

    // The consumer must only ever see strictly increasing versions.
    {
        let seen = versions.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "versions: {seen:?}");
    }
    assert!(!handle.is_degraded());

    provider.unsubscribe(handle);
    provider.stop().await;
    server.abort();
}

/// Drain channel lifecycle events, recording backoff attempt numbers,
/// until the given number of connects has been observed
async fn observe_until_connects(
    channel: &mut IngestionChannel,
    connects_wanted: u32,
) -> Vec<u32> {
    let mut backoff_attempts = Vec::new();
    let mut connects = 0;

    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Lifecycle(ConnectionState::Backoff { attempt, .. }) => {
                backoff_attempts.push(attempt);
            }
            ChannelEvent::Lifecycle(ConnectionState::Connected) => {
                connects += 1;
                if connects == connects_wanted {
                    return backoff_attempts;
                }
            }
            _ => {}
        }
    }
    panic!("channel ended after {connects} connects, wanted {connects_wanted}");
}

#[tokio::test]
async fn stable_connection_resets_attempt_counter() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Session one collapses right away: no reset earned.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;
        drop(ws);

        // Session two holds well past the stability window.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;
        sleep(Duration::from_millis(800)).await;
        drop(ws);

        // Session three stays up until the test ends.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let mut channel = IngestionChannel::spawn(
        SyncConfig {
            endpoint: format!("ws://{addr}/telemetry"),
            max_reconnect_attempts: 20,
            backoff_base_ms: 20,
            backoff_ceiling_ms: 40,
            stable_connection_ms: 300,
            liveness_timeout_ms: 60_000,
            ..SyncConfig::default()
        },
        Arc::new(SyncMetrics::default()),
    );

    let backoff_attempts = timeout(
        Duration::from_secs(10),
        observe_until_connects(&mut channel, 3),
    )
    .await
    .expect("three connects");

    // The long-held second session earned a fresh attempt budget, so
    // its drop backs off at attempt 1 again instead of 2.
    assert_eq!(backoff_attempts, vec![1, 1]);

    channel.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn silent_connection_trips_liveness_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Session one answers the resync request, then goes quiet while
        // keeping the socket open.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;
        ws.send(Message::Text(
            json!({ "type": "resync", "assets": [] }).to_string(),
        ))
        .await
        .unwrap();

        // Session two only happens if the client gave up on the silent
        // link on its own.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws2 = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws2).await;
        while ws2.next().await.is_some() {}
        drop(ws);
    });

    let mut channel = IngestionChannel::spawn(
        SyncConfig {
            endpoint: format!("ws://{addr}/telemetry"),
            max_reconnect_attempts: 20,
            backoff_base_ms: 20,
            backoff_ceiling_ms: 40,
            liveness_timeout_ms: 150,
            ..SyncConfig::default()
        },
        Arc::new(SyncMetrics::default()),
    );

    let backoff_attempts = timeout(
        Duration::from_secs(10),
        observe_until_connects(&mut channel, 2),
    )
    .await
    .expect("reconnect after silence");

    // The silent link was declared failed and routed through backoff.
    assert!(!backoff_attempts.is_empty());

    channel.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn keepalive_pings_do_not_extend_liveness() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Session one pings steadily but never sends telemetry.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws).await;
        ws.send(Message::Text(
            json!({ "type": "resync", "assets": [] }).to_string(),
        ))
        .await
        .unwrap();
        let pinger = tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(25)).await;
                if ws.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws2 = accept_async(stream).await.unwrap();
        await_resync_request(&mut ws2).await;
        while ws2.next().await.is_some() {}
        pinger.abort();
    });

    let mut channel = IngestionChannel::spawn(
        SyncConfig {
            endpoint: format!("ws://{addr}/telemetry"),
            max_reconnect_attempts: 20,
            backoff_base_ms: 20,
            backoff_ceiling_ms: 40,
            liveness_timeout_ms: 150,
            ..SyncConfig::default()
        },
        Arc::new(SyncMetrics::default()),
    );

    // A link carrying keepalives but no telemetry must still be
    // declared silent and replaced.
    let backoff_attempts = timeout(
        Duration::from_secs(10),
        observe_until_connects(&mut channel, 2),
    )
    .await
    .expect("reconnect despite pings");
    assert!(!backoff_attempts.is_empty());

    channel.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn handshake_rejection_is_terminal_unauthorized() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, header_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut header_tx = Some(header_tx);
        let reject = move |request: &Request, _response: Response| -> Result<Response, ErrorResponse> {
            let auth = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            if let Some(tx) = header_tx.take() {
                let _ = tx.send(auth);
            }
            let mut response = ErrorResponse::new(None);
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            Err(response)
        };
        let _ = accept_hdr_async(stream, reject).await;
    });

    let provider = TelemetryProvider::start(SyncConfig {
        endpoint: format!("ws://{addr}/telemetry"),
        auth_token: Some("expired-token".to_string()),
        ..SyncConfig::default()
    })
    .expect("valid config");

    // The token travelled with the handshake.
    let auth = header_rx.await.unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer expired-token"));

    // Rejection is fatal, surfaced once, never retried.
    wait_until(
        || {
            matches!(
                provider.connection_state(),
                ConnectionState::Failed {
                    reason: FailureReason::Unauthorized
                }
            )
        },
        "unauthorized failure state",
    )
    .await;

    assert_eq!(provider.metrics().frames_applied, 0);
    provider.stop().await;
}
