//! Subscription hub decoupling snapshot production from consumption
//!
//! Consumers register a callback and a [`DeliveryMode`]; the hub owns a
//! small delivery task per subscription so a slow consumer can never
//! stall the ingestion path or another consumer's feed. Within one
//! subscription snapshots always arrive in increasing version order;
//! across subscriptions no relative ordering is promised.
//!
//! Consumer callbacks must be non-blocking: delivery for a subscription
//! is single-flight, so heavy synchronous work inside the callback
//! delays that subscription's own queue. Schedule rendering or other
//! heavy work elsewhere (e.g. the next animation tick).

#![warn(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::types::{DeliveryMode, Snapshot};

/// Consumer callback invoked with each delivered snapshot
pub type SnapshotCallback = Box<dyn Fn(Arc<Snapshot>) + Send + Sync>;

/// Handle identifying one registered subscription
///
/// Dropping the handle does not unsubscribe; pass it back to
/// [`SubscriptionHub::unsubscribe`].
pub struct SubscriptionHandle {
    id: u64,
    shared: Arc<SubShared>,
}

impl SubscriptionHandle {
    /// Unique subscription identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Delivery mode this subscription was registered with
    pub fn mode(&self) -> DeliveryMode {
        self.shared.mode
    }

    /// True once the subscription has overflowed its queue and dropped
    /// a snapshot (non-fatal, the consumer stays eventually current)
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Relaxed)
    }
}

/// Pending-delivery storage, shaped by the delivery mode
enum DeliverySlot {
    /// Immediate mode: bounded FIFO of undelivered snapshots
    Queue(VecDeque<Arc<Snapshot>>),
    /// Coalesced mode: only the newest undelivered snapshot
    Latest(Option<Arc<Snapshot>>),
}

struct SubShared {
    id: u64,
    mode: DeliveryMode,
    callback: SnapshotCallback,
    slot: Mutex<DeliverySlot>,
    notify: Notify,
    degraded: AtomicBool,
    /// Unsubscribed: pending snapshots are discarded
    closed: AtomicBool,
    /// Shutting down: pending snapshots are flushed, then the task exits
    draining: AtomicBool,
    last_delivered: AtomicU64,
}

impl SubShared {
    /// Queue a snapshot for immediate delivery, dropping the oldest
    /// entry when the bound is hit. Returns true if an entry was
    /// dropped.
    fn enqueue(&self, snapshot: Arc<Snapshot>, depth: usize) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let queue = match &mut *slot {
            DeliverySlot::Queue(queue) => queue,
            DeliverySlot::Latest(_) => unreachable!("enqueue on coalesced subscription"),
        };

        let mut dropped = false;
        if queue.len() >= depth {
            // Never the newest: staying eventually current beats
            // replaying a backlog the consumer can no longer use.
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(snapshot);
        if dropped {
            self.degraded.store(true, Ordering::Relaxed);
        }
        dropped
    }

    fn set_latest(&self, snapshot: Arc<Snapshot>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            DeliverySlot::Latest(latest) => *latest = Some(snapshot),
            DeliverySlot::Queue(_) => unreachable!("set_latest on immediate subscription"),
        }
    }

    fn pop(&self) -> Option<Arc<Snapshot>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            DeliverySlot::Queue(queue) => queue.pop_front(),
            DeliverySlot::Latest(latest) => latest.take(),
        }
    }

    /// Invoke the callback unless the snapshot is older than one
    /// already delivered (dropped queue entries make gaps, never
    /// reordering)
    fn deliver(&self, snapshot: Arc<Snapshot>) {
        let version = snapshot.version;
        if version <= self.last_delivered.load(Ordering::Relaxed) {
            return;
        }
        (self.callback)(snapshot);
        self.last_delivered.store(version, Ordering::Relaxed);
    }
}

struct SubEntry {
    shared: Arc<SubShared>,
    task: JoinHandle<()>,
}

/// Fan-out point between the state store and all consumers
pub struct SubscriptionHub {
    subs: Mutex<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl SubscriptionHub {
    /// Create a hub whose immediate-mode queues hold at most
    /// `queue_depth` undelivered snapshots
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a consumer callback
    ///
    /// Must be called from within a tokio runtime; the hub spawns one
    /// delivery task per subscription.
    pub fn subscribe<F>(&self, mode: DeliveryMode, callback: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Snapshot>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = match mode {
            DeliveryMode::Immediate => DeliverySlot::Queue(VecDeque::new()),
            DeliveryMode::Coalesced { .. } => DeliverySlot::Latest(None),
        };

        let shared = Arc::new(SubShared {
            id,
            mode,
            callback: Box::new(callback),
            slot: Mutex::new(slot),
            notify: Notify::new(),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            last_delivered: AtomicU64::new(0),
        });

        let task = match mode {
            DeliveryMode::Immediate => tokio::spawn(run_immediate(Arc::clone(&shared))),
            DeliveryMode::Coalesced { interval_ms } => {
                // Anchor the tick schedule here so the cadence starts at
                // subscription time, not at the task's first poll.
                let start = Instant::now();
                tokio::spawn(run_coalesced(Arc::clone(&shared), interval_ms, start))
            }
        };

        debug!(subscription = id, mode = ?mode, "Subscription registered");
        self.subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, SubEntry { shared: Arc::clone(&shared), task });

        SubscriptionHandle { id, shared }
    }

    /// Remove a subscription
    ///
    /// Takes effect for the next notification cycle; a delivery already
    /// dispatched to the callback runs to completion, pending queued
    /// snapshots are discarded.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let entry = self
            .subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id);

        if let Some(entry) = entry {
            entry.shared.closed.store(true, Ordering::Relaxed);
            entry.shared.notify.notify_one();
            debug!(subscription = handle.id, "Subscription removed");
        }
    }

    /// Offer a freshly published snapshot to every subscription
    pub fn notify(&self, snapshot: Arc<Snapshot>) {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        for entry in subs.values() {
            match entry.shared.mode {
                DeliveryMode::Immediate => {
                    let dropped = entry.shared.enqueue(Arc::clone(&snapshot), self.queue_depth);
                    if dropped {
                        warn!(
                            subscription = entry.shared.id,
                            version = snapshot.version,
                            "Subscription queue overflow, dropped oldest snapshot"
                        );
                    }
                    entry.shared.notify.notify_one();
                }
                DeliveryMode::Coalesced { .. } => {
                    entry.shared.set_latest(Arc::clone(&snapshot));
                }
            }
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Flush pending deliveries and retire every subscription
    ///
    /// Callers must have stopped producing notifications first; pending
    /// snapshots are delivered, then the delivery tasks exit.
    pub async fn close_all(&self) {
        let entries: Vec<SubEntry> = self
            .subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in entries {
            entry.shared.draining.store(true, Ordering::Relaxed);
            entry.shared.notify.notify_one();
            let _ = entry.task.await;
        }
    }
}

/// Delivery loop for an immediate-mode subscription: single-flight, in
/// publication order, drained until empty on every wakeup
async fn run_immediate(shared: Arc<SubShared>) {
    loop {
        while let Some(snapshot) = shared.pop() {
            if shared.closed.load(Ordering::Relaxed) {
                return;
            }
            shared.deliver(snapshot);
        }
        if shared.closed.load(Ordering::Relaxed) || shared.draining.load(Ordering::Relaxed) {
            return;
        }
        shared.notify.notified().await;
    }
}

/// Delivery loop for a coalesced subscription: at most one delivery per
/// tick, always the newest snapshot, superseded versions skipped
async fn run_coalesced(shared: Arc<SubShared>, interval_ms: u64, start: Instant) {
    let period = Duration::from_millis(interval_ms.max(1));
    // First tick fires one full interval after subscription.
    let mut ticker = interval_at(start + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.closed.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(snapshot) = shared.pop() {
                    shared.deliver(snapshot);
                }
                if shared.draining.load(Ordering::Relaxed) {
                    return;
                }
            }
            _ = shared.notify.notified() => {
                if shared.closed.load(Ordering::Relaxed) {
                    return;
                }
                if shared.draining.load(Ordering::Relaxed) {
                    // Final flush outside the tick cadence.
                    if let Some(snapshot) = shared.pop() {
                        shared.deliver(snapshot);
                    }
                    return;
                }
            }
        }
    }
}
