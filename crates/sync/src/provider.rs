//! Telemetry provider: composition root and lifecycle owner
//!
//! Wires the ingestion channel, the state store, and the subscription
//! hub together, and is the only surface exposed to external
//! collaborators (the 3D scene, dashboards, alert widgets). One
//! provider owns exactly one ingestion channel; constructing the
//! provider starts it, so a second live channel per provider cannot
//! exist.

#![warn(missing_docs)]

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{self, ChannelEvent, IngestionChannel};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::hub::{SubscriptionHandle, SubscriptionHub};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::store::StateStore;
use crate::types::{ConnectionState, DeliveryMode, Snapshot};

/// Process-facing owner of the telemetry synchronization pipeline
pub struct TelemetryProvider {
    hub: Arc<SubscriptionHub>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
    state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<SyncMetrics>,
    shutdown: Arc<watch::Sender<bool>>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryProvider {
    /// Start a provider against the given configuration
    ///
    /// Validates the endpoint up front (a malformed endpoint is a
    /// configuration error, surfaced once, never retried) and spawns
    /// the single ingestion task. Must be called from within a tokio
    /// runtime.
    pub fn start(config: SyncConfig) -> SyncResult<Self> {
        channel::build_request(&config)?;

        let metrics = Arc::new(SyncMetrics::default());
        let mut ingestion = IngestionChannel::spawn(config.clone(), Arc::clone(&metrics));
        let state_rx = ingestion.watch_state();
        let shutdown = ingestion.shutdown_handle();

        let hub = Arc::new(SubscriptionHub::new(config.subscription_queue_depth));
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty());

        let ingest_hub = Arc::clone(&hub);
        let ingest_metrics = Arc::clone(&metrics);
        let event_ring_size = config.event_ring_size;

        // The single mutation context: the store is owned here and
        // nowhere else, so snapshots need no locking.
        let ingest_task = tokio::spawn(async move {
            let mut store = StateStore::new(event_ring_size);

            while let Some(event) = ingestion.next_event().await {
                match event {
                    ChannelEvent::Frame(frame) => match store.apply(frame) {
                        Some(snapshot) => {
                            SyncMetrics::incr(&ingest_metrics.frames_applied);
                            SyncMetrics::incr(&ingest_metrics.snapshots_published);
                            let _ = snapshot_tx.send(Arc::clone(&snapshot));
                            ingest_hub.notify(snapshot);
                        }
                        None => SyncMetrics::incr(&ingest_metrics.stale_frames_dropped),
                    },
                    ChannelEvent::Resync(assets) => {
                        let snapshot = store.apply_resync(assets);
                        SyncMetrics::incr(&ingest_metrics.resyncs_applied);
                        SyncMetrics::incr(&ingest_metrics.snapshots_published);
                        let _ = snapshot_tx.send(Arc::clone(&snapshot));
                        ingest_hub.notify(snapshot);
                    }
                    ChannelEvent::Lifecycle(state) => {
                        debug!(state = ?state, "Connection state changed");
                    }
                }
            }
        });

        info!(endpoint = %config.endpoint, "Telemetry provider started");
        Ok(Self {
            hub,
            snapshot_rx,
            state_rx,
            metrics,
            shutdown,
            ingest_task: Mutex::new(Some(ingest_task)),
        })
    }

    /// Current snapshot, non-blocking; version zero until the first
    /// frame or resync lands
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver that yields every published snapshot version
    pub fn watch_snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }

    /// Register a consumer callback under the given delivery mode
    pub fn subscribe<F>(&self, mode: DeliveryMode, callback: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.hub.subscribe(mode, callback)
    }

    /// Remove a subscription; effective for the next notification cycle
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.hub.unsubscribe(handle);
    }

    /// Current connection lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver for connection-state changes, for connectivity
    /// widgets
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Point-in-time view of the absorbed-error counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.read()
    }

    /// Stop the provider: tear down the channel, drain pending
    /// notifications for the current snapshot, release all
    /// subscriptions. Terminal; calling twice is a no-op.
    pub async fn stop(&self) {
        let task = self
            .ingest_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(task) = task else {
            return;
        };

        let _ = self.shutdown.send(true);
        let _ = task.await;
        self.hub.close_all().await;
        info!("Telemetry provider stopped");
    }
}
