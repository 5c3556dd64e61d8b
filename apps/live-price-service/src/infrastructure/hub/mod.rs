//! Observer Fan-out
//!
//! Delivers every accepted price to registered observers. Each observer owns
//! a bounded queue drained by its own worker task, so `notify` never blocks
//! and a slow or failing observer never delays the others.
//!
//! # Overflow
//!
//! When an observer's queue is full the oldest pending update is dropped, so
//! a lagging observer always catches up to the most recent prices.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::PriceObserver;
use crate::domain::price::PriceRecord;
use crate::infrastructure::config::SubscriberSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Observer Identity and Stats
// =============================================================================

/// Handle returned by `SubscriberHub::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObserverId(Uuid);

impl ObserverId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-observer counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObserverStats {
    /// Observer handle.
    pub id: ObserverId,
    /// Observer name.
    pub name: String,
    /// Updates waiting in the queue.
    pub queued: usize,
    /// Updates handled successfully.
    pub delivered: u64,
    /// Updates dropped because the queue was full.
    pub dropped: u64,
    /// Current run of consecutive errors.
    pub consecutive_failures: u32,
}

/// Hub-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered observers.
    pub observer_count: usize,
    /// Updates passed to `notify`.
    pub published: u64,
    /// Observers removed after repeated failures.
    pub deregistered: u64,
    /// Per-observer detail.
    pub observers: Vec<ObserverStats>,
}

impl HubStats {
    /// Updates dropped across all current observers.
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.observers.iter().map(|o| o.dropped).sum()
    }
}

// =============================================================================
// Observer Slot
// =============================================================================

struct ObserverSlot {
    name: String,
    queue: Mutex<VecDeque<PriceRecord>>,
    wake: Notify,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU32,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverSlot {
    /// Enqueue, evicting the oldest entry when full. Returns true on drop.
    fn push(&self, record: PriceRecord, capacity: usize) -> bool {
        let overflowed = {
            let mut queue = self.queue.lock();
            queue.push_back(record);
            if queue.len() > capacity {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_one();
        overflowed
    }

    fn stats(&self, id: ObserverId) -> ObserverStats {
        ObserverStats {
            id,
            name: self.name.clone(),
            queued: self.queue.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            consecutive_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

struct HubShared {
    observers: RwLock<HashMap<ObserverId, Arc<ObserverSlot>>>,
    deregistered: AtomicU64,
}

// =============================================================================
// Subscriber Hub
// =============================================================================

/// Fan-out of price updates to registered observers.
pub struct SubscriberHub {
    shared: Arc<HubShared>,
    queue_capacity: usize,
    max_consecutive_failures: u32,
    published: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("observers", &self.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl SubscriberHub {
    /// Create a hub with the given queue capacity and failure limit.
    #[must_use]
    pub fn new(settings: &SubscriberSettings) -> Self {
        Self {
            shared: Arc::new(HubShared {
                observers: RwLock::new(HashMap::new()),
                deregistered: AtomicU64::new(0),
            }),
            queue_capacity: settings.queue_capacity.max(1),
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Register an observer and start its worker.
    ///
    /// Returns `None` once the hub has been shut down. Must be called from
    /// within a tokio runtime.
    pub fn register(&self, observer: Arc<dyn PriceObserver>) -> Option<ObserverId> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let id = ObserverId::new();
        let slot = Arc::new(ObserverSlot {
            name: observer.name().to_string(),
            queue: Mutex::new(VecDeque::with_capacity(self.queue_capacity)),
            wake: Notify::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            cancel: self.cancel.child_token(),
            worker: Mutex::new(None),
        });

        self.shared.observers.write().insert(id, Arc::clone(&slot));

        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            id,
            Arc::clone(&slot),
            observer,
            self.max_consecutive_failures,
        ));
        *slot.worker.lock() = Some(handle);

        tracing::info!(observer_id = %id, name = %slot.name, "Observer registered");
        Some(id)
    }

    /// Remove an observer. Pending updates are discarded.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.shared.observers.write().remove(&id);
        match removed {
            Some(slot) => {
                slot.cancel.cancel();
                tracing::info!(observer_id = %id, name = %slot.name, "Observer unregistered");
                true
            }
            None => false,
        }
    }

    /// Queue an update for every observer. Never blocks on observers.
    pub fn notify(&self, record: &PriceRecord) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let observers = self.shared.observers.read();
        let mut dropped = 0_u64;
        for slot in observers.values() {
            if slot.push(record.clone(), self.queue_capacity) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            metrics::record_observer_dropped(dropped);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.observers.read().len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.observers.read().is_empty()
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let observers = self.shared.observers.read();
        let mut detail: Vec<ObserverStats> = observers
            .iter()
            .map(|(id, slot)| slot.stats(*id))
            .collect();
        detail.sort_by(|a, b| a.name.cmp(&b.name));

        HubStats {
            observer_count: observers.len(),
            published: self.published.load(Ordering::Relaxed),
            deregistered: self.shared.deregistered.load(Ordering::Relaxed),
            observers: detail,
        }
    }

    /// Stop every worker and reject further registrations.
    ///
    /// Pending updates are discarded. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let slots: Vec<Arc<ObserverSlot>> = self
            .shared
            .observers
            .write()
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        for slot in slots {
            let handle = slot.worker.lock().take();
            if let Some(handle) = handle
                && let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!(name = %slot.name, "Observer worker panicked");
            }
        }
        tracing::info!("Subscriber hub shut down");
    }
}

async fn run_worker(
    shared: Arc<HubShared>,
    id: ObserverId,
    slot: Arc<ObserverSlot>,
    observer: Arc<dyn PriceObserver>,
    max_consecutive_failures: u32,
) {
    loop {
        if slot.cancel.is_cancelled() {
            break;
        }

        let next = slot.queue.lock().pop_front();
        let Some(record) = next else {
            tokio::select! {
                () = slot.cancel.cancelled() => break,
                () = slot.wake.notified() => {}
            }
            continue;
        };

        match observer.on_price(&record).await {
            Ok(()) => {
                slot.failures.store(0, Ordering::Relaxed);
                slot.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = slot.failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    observer_id = %id,
                    name = %slot.name,
                    symbol = record.symbol(),
                    consecutive_failures = failures,
                    error = %e,
                    "Observer failed to handle price"
                );
                if failures >= max_consecutive_failures {
                    if shared.observers.write().remove(&id).is_some() {
                        shared.deregistered.fetch_add(1, Ordering::Relaxed);
                        metrics::record_observer_deregistered();
                    }
                    tracing::warn!(
                        observer_id = %id,
                        name = %slot.name,
                        "Observer deregistered after repeated failures"
                    );
                    break;
                }
            }
        }
    }
    tracing::debug!(observer_id = %id, name = %slot.name, "Observer worker stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::application::ports::ObserverError;
    use crate::domain::price::PriceSource;

    fn record(ts: i64) -> PriceRecord {
        PriceRecord::new("AAPL", Decimal::ONE, 0, ts, PriceSource::Stream).unwrap()
    }

    fn hub(queue_capacity: usize, max_consecutive_failures: u32) -> SubscriberHub {
        SubscriberHub::new(&SubscriberSettings {
            queue_capacity,
            max_consecutive_failures,
        })
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<i64>>,
        gate: Option<Semaphore>,
        fail_odd: bool,
        always_fail: bool,
    }

    impl Recording {
        fn seen(&self) -> Vec<i64> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl PriceObserver for Recording {
        async fn on_price(&self, record: &PriceRecord) -> Result<(), ObserverError> {
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|e| ObserverError::Unavailable(e.to_string()))?
                    .forget();
            }
            self.seen.lock().push(record.event_timestamp());
            if self.always_fail || (self.fail_odd && record.event_timestamp() % 2 == 1) {
                return Err(ObserverError::Rejected("nope".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn burst_beyond_capacity_keeps_most_recent() {
        let hub = hub(3, 3);
        let observer = Arc::new(Recording::default());
        hub.register(observer.clone()).unwrap();

        for ts in 0..10 {
            hub.notify(&record(ts));
        }

        wait_for(|| observer.seen().len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.seen(), vec![7, 8, 9]);

        let stats = hub.stats();
        assert_eq!(stats.published, 10);
        assert_eq!(stats.total_dropped(), 7);
    }

    #[tokio::test]
    async fn slow_observer_does_not_delay_others() {
        let hub = hub(3, 3);
        let slow = Arc::new(Recording {
            gate: Some(Semaphore::new(0)),
            ..Recording::default()
        });
        let fast = Arc::new(Recording::default());
        hub.register(slow.clone()).unwrap();
        hub.register(fast.clone()).unwrap();

        for ts in 0..10 {
            hub.notify(&record(ts));
            let expected = usize::try_from(ts + 1).unwrap();
            wait_for(|| fast.seen().len() == expected).await;
        }
        assert_eq!(fast.seen(), (0..10).collect::<Vec<_>>());
        assert!(slow.seen().is_empty());

        if let Some(gate) = &slow.gate {
            gate.add_permits(100);
        }
        wait_for(|| slow.seen().len() == 4).await;
        assert_eq!(slow.seen(), vec![0, 7, 8, 9]);
    }

    #[tokio::test]
    async fn repeated_failures_deregister_observer() {
        let hub = hub(16, 3);
        let failing = Arc::new(Recording {
            always_fail: true,
            ..Recording::default()
        });
        hub.register(failing.clone()).unwrap();

        for ts in 0..5 {
            hub.notify(&record(ts));
        }

        wait_for(|| hub.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(failing.seen(), vec![0, 1, 2]);
        assert_eq!(hub.stats().deregistered, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let hub = hub(16, 2);
        let flaky = Arc::new(Recording {
            fail_odd: true,
            ..Recording::default()
        });
        hub.register(flaky.clone()).unwrap();

        for ts in 0..8 {
            hub.notify(&record(ts));
        }

        wait_for(|| flaky.seen().len() == 8).await;
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.stats().deregistered, 0);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = hub(16, 3);
        let observer = Arc::new(Recording::default());
        let id = hub.register(observer.clone()).unwrap();

        hub.notify(&record(1));
        wait_for(|| observer.seen().len() == 1).await;

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        hub.notify(&record(2));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(observer.seen(), vec![1]);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_observers() {
        let hub = hub(16, 3);
        hub.register(Arc::new(Recording::default())).unwrap();

        hub.shutdown().await;
        hub.shutdown().await;

        assert!(hub.is_empty());
        assert!(hub.register(Arc::new(Recording::default())).is_none());
        hub.notify(&record(1));
        assert_eq!(hub.stats().published, 0);
    }
}
