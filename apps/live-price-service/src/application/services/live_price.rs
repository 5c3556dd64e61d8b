//! Live Price Service
//!
//! Single entry point for price consumers. Keeps the latest price per symbol
//! in a bounded cache fed by the push feed, refreshes stale or missing
//! symbols from the fallback source, and fans every accepted price out to
//! registered observers.
//!
//! # Tasks
//!
//! `start` spawns, all under one shutdown token:
//! - `ingest`: drains push feed events into the cache and the hub
//! - `supervisor`: push feed connection lifecycle (only with a feed configured)
//! - `purge`: drops entries older than the cache max age
//! - `backfill`: periodic staleness sweep plus on-demand fallback requests

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FallbackSource, PriceObserver};
use crate::domain::price::{PriceRecord, now_millis};
use crate::domain::subscription::{
    DEFAULT_MARKET, SubscriptionChanges, SubscriptionSet, Symbol, SymbolError, validate_symbol,
    validate_symbols,
};
use crate::infrastructure::cache::{BoundedPriceCache, SetOutcome};
use crate::infrastructure::config::{ConfigError, ServiceConfig};
use crate::infrastructure::fallback::FallbackFetcher;
use crate::infrastructure::feed::{ConnectionState, ConnectionSupervisor, ControlRequest, StreamEvent};
use crate::infrastructure::hub::{ObserverId, SubscriberHub};
use crate::infrastructure::latency::LatencyTracker;
use crate::infrastructure::metrics;

use super::service_metrics::{FeedStatus, ServiceMetrics};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const CONTROL_CHANNEL_CAPACITY: usize = 64;
const ON_DEMAND_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Errors
// =============================================================================

/// Live price service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Symbol failed validation.
    #[error(transparent)]
    InvalidSymbol(#[from] SymbolError),

    /// Market name was empty.
    #[error("market name cannot be empty")]
    EmptyMarket,

    /// Operation requires a service that has not been stopped.
    #[error("live price service has been stopped")]
    Stopped,
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

struct FeedHandle {
    supervisor: Arc<ConnectionSupervisor>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlRequest>>>,
}

/// Live price ingestion and caching service.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use live_price_service::application::services::LivePriceService;
/// use live_price_service::infrastructure::config::ServiceConfig;
/// use live_price_service::infrastructure::fallback::HttpFallbackSource;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = ServiceConfig::new("https://quotes.example.com");
///     config.universe = vec![("us".to_string(), vec!["AAPL".to_string()])];
///
///     let source = Arc::new(HttpFallbackSource::new(&config.fallback)?);
///     let service = LivePriceService::new(config, source)?;
///     service.start().await?;
///
///     if let Some(price) = service.get_price("AAPL") {
///         println!("{} {}", price.symbol(), price.price());
///     }
///
///     service.stop().await;
///     Ok(())
/// }
/// ```
pub struct LivePriceService {
    config: ServiceConfig,
    cache: Arc<BoundedPriceCache>,
    subscriptions: Arc<SubscriptionSet>,
    fetcher: Arc<FallbackFetcher>,
    hub: Arc<SubscriberHub>,
    ingest_latency: Arc<LatencyTracker>,
    feed: Option<FeedHandle>,
    on_demand_tx: mpsc::Sender<Symbol>,
    on_demand_rx: Mutex<Option<mpsc::Receiver<Symbol>>>,
    pending: Arc<Mutex<HashSet<Symbol>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    running: AtomicBool,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LivePriceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePriceService")
            .field("running", &self.is_running())
            .field("feed", &self.feed.is_some())
            .field("cached", &self.cache.len())
            .field("subscribed", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl LivePriceService {
    /// Build a service from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Config` or `ServiceError::InvalidSymbol` when
    /// the configuration or its symbol universe is invalid.
    pub fn new(config: ServiceConfig, source: Arc<dyn FallbackSource>) -> Result<Self, ServiceError> {
        config.validate()?;

        let subscriptions = Arc::new(SubscriptionSet::from_universe(
            config
                .universe
                .iter()
                .map(|(market, symbols)| (market.as_str(), symbols.as_slice())),
        )?);

        let feed = config.feed.clone().map(|settings| {
            let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
            FeedHandle {
                supervisor: Arc::new(ConnectionSupervisor::new(
                    settings,
                    Arc::clone(&subscriptions),
                    control_tx.clone(),
                )),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
            }
        });

        let (on_demand_tx, on_demand_rx) = mpsc::channel(ON_DEMAND_CHANNEL_CAPACITY);

        Ok(Self {
            cache: Arc::new(BoundedPriceCache::new(config.cache.capacity)),
            fetcher: Arc::new(FallbackFetcher::new(
                source,
                &config.fallback,
                config.cache.latency_buffer_size,
            )),
            hub: Arc::new(SubscriberHub::new(&config.subscribers)),
            ingest_latency: Arc::new(LatencyTracker::new(config.cache.latency_buffer_size)),
            subscriptions,
            feed,
            on_demand_tx,
            on_demand_rx: Mutex::new(Some(on_demand_rx)),
            pending: Arc::new(Mutex::new(HashSet::new())),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Created),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start background tasks and warm the cache. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Stopped` if the service was already stopped.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(ServiceError::Stopped),
            Lifecycle::Created => {}
        }

        tracing::info!(
            symbols = self.subscriptions.len(),
            feed = self.feed.is_some(),
            cache_capacity = self.cache.capacity(),
            "Starting live price service"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.start_ingest_loop(events_rx);

        self.warm_up().await;

        if let Some(feed) = &self.feed {
            let control_rx = feed.control_rx.lock().take();
            if let Some(control_rx) = control_rx {
                let supervisor = Arc::clone(&feed.supervisor);
                self.spawn_task(
                    "supervisor",
                    supervisor.run(events_tx, control_rx, self.shutdown.child_token()),
                );
            }
        } else {
            drop(events_tx);
        }

        self.start_purge_loop();
        self.start_backfill_loop();

        metrics::set_subscribed_symbols(self.subscriptions.len());
        self.running.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running;
        drop(lifecycle);

        tracing::info!("Live price service started");
        Ok(())
    }

    /// Cancel every task and wait for them up to the shutdown timeout.
    ///
    /// Tasks still running at the deadline are aborted. Idempotent; a
    /// stopped service cannot be started again.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        *lifecycle = Lifecycle::Stopped;
        self.running.store(false, Ordering::Release);

        tracing::info!("Stopping live price service");
        let deadline = tokio::time::Instant::now() + self.config.server.shutdown_timeout;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
                Ok(Err(e)) => {
                    if e.is_panic() {
                        tracing::error!(task = name, "Task panicked");
                    }
                }
                Err(_) => {
                    tracing::warn!(task = name, "Task missed shutdown deadline, aborting");
                    handle.abort();
                }
            }
        }

        if tokio::time::timeout_at(deadline, self.hub.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("Observer workers missed shutdown deadline");
        }

        self.pending.lock().clear();
        metrics::set_feed_connected(false);
        drop(lifecycle);
        tracing::info!("Live price service stopped");
    }

    /// Whether `start` has completed and `stop` has not been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Leave the terminal feed-unavailable state.
    ///
    /// Returns `false` when no feed is configured or it was not unavailable.
    pub fn resume_feed(&self) -> bool {
        self.feed
            .as_ref()
            .is_some_and(|feed| feed.supervisor.resume())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Latest cached price for `symbol`. Never blocks on the network.
    ///
    /// A missing or stale entry schedules a fallback fetch; concurrent
    /// requests for the same symbol share one fetch.
    pub fn get_price(&self, symbol: &str) -> Option<PriceRecord> {
        let symbol = validate_symbol(symbol).ok()?;
        let cached = self.cache.get(&symbol);

        let fresh = cached
            .as_ref()
            .is_some_and(|record| !record.is_stale(now_millis(), self.staleness_ms()));
        if !fresh {
            self.request_fallback(symbol);
        }
        cached
    }

    /// Cached prices for `symbols`, with missing symbols fetched from the
    /// fallback source before returning.
    ///
    /// The gap fill is bounded by the gap fill timeout; symbols that cannot
    /// be priced in time are absent from the result. Stale entries are
    /// returned as they are and refreshed in the background.
    pub async fn get_all_prices(&self, symbols: &[Symbol]) -> HashMap<Symbol, PriceRecord> {
        let now = now_millis();
        let staleness_ms = self.staleness_ms();
        let mut prices = HashMap::with_capacity(symbols.len());
        let mut seen = HashSet::with_capacity(symbols.len());
        let mut missing = Vec::new();

        for raw in symbols {
            let Ok(symbol) = validate_symbol(raw) else {
                continue;
            };
            if !seen.insert(symbol.clone()) {
                continue;
            }
            match self.cache.get(&symbol) {
                Some(record) => {
                    if record.is_stale(now, staleness_ms) {
                        self.request_fallback(symbol.clone());
                    }
                    prices.insert(symbol, record);
                }
                None => missing.push(symbol),
            }
        }

        if missing.is_empty() {
            return prices;
        }

        let timeout = self.config.fallback.gap_fill_timeout;
        match tokio::time::timeout(timeout, self.fetcher.fetch_batch(&missing)).await {
            Ok(batch) => {
                for (symbol, record) in batch.prices {
                    let outcome = apply_record(&self.cache, &self.hub, record.clone());
                    let record = if outcome.is_stored() {
                        record
                    } else {
                        self.cache.peek(&symbol).unwrap_or(record)
                    };
                    prices.insert(symbol, record);
                }
                metrics::set_cache_size(self.cache.len());
                if !batch.errors.is_empty() {
                    tracing::debug!(
                        missing = missing.len(),
                        unfilled = batch.errors.len(),
                        "Gap fill left symbols unpriced"
                    );
                }
            }
            Err(_) => {
                tracing::warn!(
                    missing = missing.len(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Gap fill timed out"
                );
            }
        }
        prices
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe symbols under the default market.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidSymbol` if any symbol is invalid; the
    /// subscription set is left untouched in that case.
    pub fn subscribe<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<SubscriptionChanges, ServiceError> {
        self.subscribe_market(DEFAULT_MARKET, symbols)
    }

    /// Subscribe symbols under `market`.
    ///
    /// Newly added symbols are sent to a live feed session and primed
    /// from the fallback source.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::EmptyMarket` or `ServiceError::InvalidSymbol`.
    pub fn subscribe_market<S: AsRef<str>>(
        &self,
        market: &str,
        symbols: &[S],
    ) -> Result<SubscriptionChanges, ServiceError> {
        let market = market.trim();
        if market.is_empty() {
            return Err(ServiceError::EmptyMarket);
        }
        let symbols = validate_symbols(symbols)?;

        let changes = self.subscriptions.add(market, &symbols);
        if !changes.subscribe.is_empty() {
            tracing::info!(market, added = changes.subscribe.len(), "Symbols subscribed");
            self.send_control(ControlRequest::Subscribe(changes.subscribe.clone()));
            for symbol in &changes.subscribe {
                if self.cache.peek(symbol).is_none() {
                    self.request_fallback(symbol.clone());
                }
            }
        }
        metrics::set_subscribed_symbols(self.subscriptions.len());
        Ok(changes)
    }

    /// Unsubscribe symbols from whichever market holds them.
    ///
    /// Cached prices stay until purged.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidSymbol` if any symbol is invalid.
    pub fn unsubscribe<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<SubscriptionChanges, ServiceError> {
        let symbols = validate_symbols(symbols)?;

        let changes = self.subscriptions.remove(&symbols);
        if !changes.unsubscribe.is_empty() {
            tracing::info!(removed = changes.unsubscribe.len(), "Symbols unsubscribed");
            self.send_control(ControlRequest::Unsubscribe(changes.unsubscribe.clone()));
        }
        metrics::set_subscribed_symbols(self.subscriptions.len());
        Ok(changes)
    }

    /// All subscribed symbols, sorted.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.subscriptions.symbols()
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Register an observer for every accepted price.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Stopped` once the service has been stopped.
    pub fn register_observer(
        &self,
        observer: Arc<dyn PriceObserver>,
    ) -> Result<ObserverId, ServiceError> {
        self.hub.register(observer).ok_or(ServiceError::Stopped)
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.hub.unregister(id)
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Point-in-time view of the service.
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        let connection = self
            .feed
            .as_ref()
            .map(|feed| feed.supervisor.health_snapshot());

        ServiceMetrics {
            running: self.is_running(),
            feed_status: FeedStatus::from_health(connection.as_ref()),
            connection,
            ingest_latency: self.ingest_latency.snapshot(),
            fallback_latency: self.fetcher.latency(),
            cache: self.cache.stats(),
            observers: self.hub.stats(),
            subscriptions: self.subscriptions.stats(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn staleness_ms(&self) -> i64 {
        i64::try_from(self.config.cache.staleness_threshold.as_millis()).unwrap_or(i64::MAX)
    }

    fn spawn_task<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().push((name, handle));
    }

    /// Queue a fallback fetch unless one is already pending for `symbol`.
    fn request_fallback(&self, symbol: Symbol) {
        if !self.is_running() {
            return;
        }
        if !self.pending.lock().insert(symbol.clone()) {
            return;
        }
        if let Err(e) = self.on_demand_tx.try_send(symbol) {
            let symbol = e.into_inner();
            tracing::debug!(symbol, "On-demand fallback queue full");
            self.pending.lock().remove(&symbol);
        }
    }

    fn send_control(&self, request: ControlRequest) {
        let Some(feed) = &self.feed else {
            return;
        };
        // Connecting and Subscribing sessions drain or replay the queue; a
        // disconnected one replays the whole set on its next connect.
        if matches!(
            feed.supervisor.state(),
            ConnectionState::Disconnected | ConnectionState::Faulted
        ) {
            return;
        }
        if let Err(e) = feed.control_tx.try_send(request) {
            tracing::warn!(error = %e, "Dropped subscription control request");
        }
    }

    async fn warm_up(&self) {
        let symbols = self.subscriptions.symbols();
        if symbols.is_empty() {
            return;
        }

        let started = Instant::now();
        let timeout = self.config.fallback.warmup_timeout;
        let fetch = tokio::time::timeout(timeout, self.fetcher.fetch_batch(&symbols));
        let outcome = tokio::select! {
            () = self.shutdown.cancelled() => return,
            outcome = fetch => outcome,
        };

        match outcome {
            Ok(batch) => {
                let failed = batch.errors.len();
                let stored = apply_batch(&self.cache, &self.hub, batch.prices);
                tracing::info!(
                    requested = symbols.len(),
                    stored,
                    failed,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Cache warm-up complete"
                );
            }
            Err(_) => {
                tracing::warn!(
                    requested = symbols.len(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Cache warm-up timed out"
                );
            }
        }
    }

    fn start_ingest_loop(&self, mut events: mpsc::Receiver<StreamEvent>) {
        let cache = Arc::clone(&self.cache);
        let hub = Arc::clone(&self.hub);
        let latency = Arc::clone(&self.ingest_latency);
        let shutdown = self.shutdown.clone();

        self.spawn_task("ingest", async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    StreamEvent::Price {
                        record,
                        received_at,
                    } => {
                        apply_record(&cache, &hub, record);
                        let elapsed = received_at.elapsed();
                        latency.record(elapsed, true);
                        metrics::record_ingest_duration(elapsed);
                        metrics::set_cache_size(cache.len());
                    }
                    StreamEvent::DecodeFailed {
                        reason,
                        received_at,
                    } => {
                        tracing::debug!(reason, "Skipped undecodable feed data");
                        latency.record(received_at.elapsed(), false);
                    }
                }
            }
            tracing::debug!("Ingest loop stopped");
        });
    }

    fn start_purge_loop(&self) {
        let cache = Arc::clone(&self.cache);
        let shutdown = self.shutdown.clone();
        let period = self.config.cache.purge_interval;
        let max_age = self.config.cache.max_age;

        self.spawn_task("purge", async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = cache.purge(max_age);
                        if removed > 0 {
                            tracing::info!(removed, remaining = cache.len(), "Purged expired prices");
                            metrics::record_cache_purged(removed);
                        }
                        metrics::set_cache_size(cache.len());
                    }
                }
            }
            tracing::debug!("Purge loop stopped");
        });
    }

    fn start_backfill_loop(&self) {
        let Some(mut on_demand) = self.on_demand_rx.lock().take() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        let hub = Arc::clone(&self.hub);
        let fetcher = Arc::clone(&self.fetcher);
        let subscriptions = Arc::clone(&self.subscriptions);
        let pending = Arc::clone(&self.pending);
        let shutdown = self.shutdown.clone();
        let period = self.config.cache.backfill_interval;
        let staleness_ms = self.staleness_ms();

        self.spawn_task("backfill", async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let (requested, reason) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        (stale_symbols(&cache, &subscriptions, staleness_ms), "sweep")
                    }
                    Some(symbol) = on_demand.recv() => {
                        let mut batch = vec![symbol];
                        while let Ok(next) = on_demand.try_recv() {
                            batch.push(next);
                        }
                        (batch, "on_demand")
                    }
                };
                if requested.is_empty() {
                    continue;
                }

                let batch = tokio::select! {
                    () = shutdown.cancelled() => break,
                    batch = fetcher.fetch_batch(&requested) => batch,
                };
                let failed = batch.errors.len();
                let stored = apply_batch(&cache, &hub, batch.prices);
                {
                    let mut pending = pending.lock();
                    for symbol in &requested {
                        pending.remove(symbol);
                    }
                }
                tracing::debug!(
                    reason,
                    requested = requested.len(),
                    stored,
                    failed,
                    "Backfill complete"
                );
            }
            tracing::debug!("Backfill loop stopped");
        });
    }
}

/// Write to the cache, then notify observers if the write was accepted.
fn apply_record(cache: &BoundedPriceCache, hub: &SubscriberHub, record: PriceRecord) -> SetOutcome {
    let outcome = cache.set(record.clone());
    metrics::record_cache_write(&outcome);
    match &outcome {
        SetOutcome::Evicted { evicted } => {
            tracing::debug!(evicted = %evicted, symbol = record.symbol(), "Evicted least recently used price");
        }
        SetOutcome::Rejected { current_timestamp } => {
            tracing::trace!(
                symbol = record.symbol(),
                timestamp = record.event_timestamp(),
                current_timestamp,
                "Ignored out-of-order price"
            );
        }
        SetOutcome::Inserted | SetOutcome::Replaced => {}
    }
    if outcome.is_stored() {
        hub.notify(&record);
    }
    outcome
}

fn apply_batch(
    cache: &BoundedPriceCache,
    hub: &SubscriberHub,
    prices: HashMap<Symbol, PriceRecord>,
) -> usize {
    let stored = prices
        .into_values()
        .filter(|record| apply_record(cache, hub, record.clone()).is_stored())
        .count();
    metrics::set_cache_size(cache.len());
    stored
}

fn stale_symbols(cache: &BoundedPriceCache, subscriptions: &SubscriptionSet, staleness_ms: i64) -> Vec<Symbol> {
    let now = now_millis();
    subscriptions
        .symbols()
        .into_iter()
        .filter(|symbol| {
            cache
                .peek(symbol)
                .is_none_or(|record| record.is_stale(now, staleness_ms))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
