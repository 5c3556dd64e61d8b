//! Bounded Price Cache
//!
//! Fixed-capacity symbol → `PriceRecord` store with least-recently-used
//! eviction and explicit age-based purging.
//!
//! # Layout
//!
//! Entries live in a slot arena. An intrusive doubly-linked list threads the
//! occupied slots in access order (head = most recent, tail = least recent)
//! and a hash index maps symbols to slots. Get, set and evict are O(1); freed
//! slots are recycled so steady-state writes do not grow the arena.
//!
//! Purging is a separate maintenance call so the write path never scans.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::price::{PriceRecord, now_millis};
use crate::domain::subscription::Symbol;

// =============================================================================
// Entries and Slots
// =============================================================================

/// Cached record plus bookkeeping. Never leaves the cache.
#[derive(Debug)]
struct CacheEntry {
    record: PriceRecord,
    last_access: Instant,
    access_count: u64,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

// =============================================================================
// Set Outcome
// =============================================================================

/// Result of a `set` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// New symbol stored without eviction.
    Inserted,
    /// Existing record for the symbol replaced.
    Replaced,
    /// New symbol stored after evicting the least-recently-used entry.
    Evicted {
        /// Symbol that was evicted.
        evicted: Symbol,
    },
    /// Stored record is strictly newer; nothing changed.
    Rejected {
        /// Event timestamp of the record that was kept.
        current_timestamp: i64,
    },
}

impl SetOutcome {
    /// Whether the candidate record is now the stored record.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

// =============================================================================
// LRU State
// =============================================================================

#[derive(Debug)]
struct LruState {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<Symbol, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    eviction_count: u64,
    purged_count: u64,
    rejected_count: u64,
    hits: u64,
    misses: u64,
}

impl LruState {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            eviction_count: 0,
            purged_count: 0,
            rejected_count: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn slot(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Slot> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn detach(&mut self, idx: usize) {
        let Some((prev, next)) = self.slot(idx).map(|s| (s.prev, s.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(slot) = self.slot_mut(p) {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slot_mut(n) {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(slot) = self.slot_mut(idx) {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slot_mut(idx) {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(slot) = self.slot_mut(h)
        {
            slot.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.detach(idx);
            self.attach_front(idx);
        }
    }

    fn allocate(&mut self, slot: Slot) -> usize {
        if let Some(idx) = self.free.pop() {
            if let Some(place) = self.slots.get_mut(idx) {
                *place = Some(slot);
            }
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Option<CacheEntry> {
        self.detach(idx);
        let slot = self.slots.get_mut(idx).and_then(Option::take)?;
        self.index.remove(slot.entry.record.symbol());
        self.free.push(idx);
        Some(slot.entry)
    }

    fn iter_entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.iter().flatten().map(|slot| &slot.entry)
    }
}

// =============================================================================
// Bounded Price Cache
// =============================================================================

/// Thread-safe LRU price cache with a fixed capacity.
///
/// # Example
///
/// ```rust
/// use live_price_service::domain::price::{PriceRecord, PriceSource};
/// use live_price_service::infrastructure::cache::BoundedPriceCache;
/// use rust_decimal::Decimal;
///
/// let cache = BoundedPriceCache::new(2);
/// let rec = |s: &str| PriceRecord::new(s, Decimal::ONE, 0, 100, PriceSource::Stream).unwrap();
///
/// cache.set(rec("A"));
/// cache.set(rec("B"));
/// cache.get("A");
/// cache.set(rec("C"));
///
/// assert!(cache.get("B").is_none());
/// assert!(cache.get("A").is_some());
/// assert!(cache.get("C").is_some());
/// ```
#[derive(Debug)]
pub struct BoundedPriceCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl BoundedPriceCache {
    /// Create a cache holding at most `capacity` symbols (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(LruState::with_capacity(capacity)),
        }
    }

    /// Look up a symbol, marking it most recently used.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<PriceRecord> {
        let mut state = self.state.lock();
        let Some(idx) = state.index.get(symbol).copied() else {
            state.misses += 1;
            return None;
        };

        state.hits += 1;
        state.touch(idx);
        let slot = state.slot_mut(idx)?;
        slot.entry.last_access = Instant::now();
        slot.entry.access_count += 1;
        Some(slot.entry.record.clone())
    }

    /// Look up a symbol without affecting recency or statistics.
    #[must_use]
    pub fn peek(&self, symbol: &str) -> Option<PriceRecord> {
        let state = self.state.lock();
        let idx = state.index.get(symbol).copied()?;
        state.slot(idx).map(|slot| slot.entry.record.clone())
    }

    /// Store a record under the timestamp-wins rule.
    ///
    /// The write is rejected when the stored record for the symbol is
    /// strictly newer. Otherwise the record is stored and becomes most
    /// recently used; a new symbol at full capacity first evicts the least
    /// recently used entry.
    pub fn set(&self, record: PriceRecord) -> SetOutcome {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(idx) = state.index.get(record.symbol()).copied() {
            let Some(slot) = state.slot_mut(idx) else {
                return SetOutcome::Rejected {
                    current_timestamp: record.event_timestamp(),
                };
            };
            if !record.supersedes(&slot.entry.record) {
                let current_timestamp = slot.entry.record.event_timestamp();
                state.rejected_count += 1;
                return SetOutcome::Rejected { current_timestamp };
            }
            slot.entry.record = record;
            slot.entry.last_access = now;
            state.touch(idx);
            return SetOutcome::Replaced;
        }

        let mut evicted = None;
        if state.index.len() >= self.capacity
            && let Some(tail) = state.tail
            && let Some(entry) = state.remove_slot(tail)
        {
            state.eviction_count += 1;
            evicted = Some(entry.record.symbol().to_string());
        }

        let symbol = record.symbol().to_string();
        let idx = state.allocate(Slot {
            entry: CacheEntry {
                record,
                last_access: now,
                access_count: 0,
            },
            prev: None,
            next: None,
        });
        state.index.insert(symbol, idx);
        state.attach_front(idx);

        evicted.map_or(SetOutcome::Inserted, |evicted| SetOutcome::Evicted {
            evicted,
        })
    }

    /// Remove every entry whose event timestamp is more than `max_age` old.
    ///
    /// Returns the number of entries removed.
    pub fn purge(&self, max_age: Duration) -> usize {
        self.purge_at(max_age, now_millis())
    }

    /// `purge` against an explicit clock reading in epoch milliseconds.
    pub fn purge_at(&self, max_age: Duration, now_ms: i64) -> usize {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.state.lock();

        let expired: Vec<usize> = state
            .index
            .values()
            .copied()
            .filter(|&idx| {
                state
                    .slot(idx)
                    .is_some_and(|slot| slot.entry.record.is_stale(now_ms, max_age_ms))
            })
            .collect();

        let removed = expired
            .into_iter()
            .filter_map(|idx| state.remove_slot(idx))
            .count();
        state.purged_count += removed as u64;
        removed
    }

    /// Number of cached symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of symbols.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached symbols from most to least recently used.
    #[must_use]
    pub fn symbols_by_recency(&self) -> Vec<Symbol> {
        let state = self.state.lock();
        let mut symbols = Vec::with_capacity(state.index.len());
        let mut cursor = state.head;
        while let Some(idx) = cursor {
            let Some(slot) = state.slot(idx) else { break };
            symbols.push(slot.entry.record.symbol().to_string());
            cursor = slot.next;
        }
        symbols
    }

    /// Cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut entries_by_access: Vec<AccessCount> = state
            .iter_entries()
            .map(|entry| AccessCount {
                symbol: entry.record.symbol().to_string(),
                access_count: entry.access_count,
                idle_ms: u64::try_from(entry.last_access.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();
        entries_by_access.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        CacheStats {
            size: state.index.len(),
            capacity: self.capacity,
            eviction_count: state.eviction_count,
            purged_count: state.purged_count,
            rejected_count: state.rejected_count,
            hits: state.hits,
            misses: state.misses,
            entries_by_access,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Access count for one cached symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessCount {
    /// Cached symbol.
    pub symbol: Symbol,
    /// Number of `get` hits.
    pub access_count: u64,
    /// Milliseconds since the last get or accepted set.
    pub idle_ms: u64,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Current number of entries.
    pub size: usize,
    /// Fixed capacity.
    pub capacity: usize,
    /// Entries evicted under capacity pressure.
    pub eviction_count: u64,
    /// Entries removed by age purges.
    pub purged_count: u64,
    /// Writes rejected because the stored record was newer.
    pub rejected_count: u64,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
    /// Entries ordered by access count, most accessed first.
    pub entries_by_access: Vec<AccessCount>,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 when there were none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::price::PriceSource;

    fn rec(symbol: &str, ts: i64, source: PriceSource) -> PriceRecord {
        PriceRecord::new(symbol, Decimal::from(ts.max(1)), 10, ts, source).unwrap()
    }

    fn stream(symbol: &str, ts: i64) -> PriceRecord {
        rec(symbol, ts, PriceSource::Stream)
    }

    #[test]
    fn get_absent_is_none() {
        let cache = BoundedPriceCache::new(4);
        assert!(cache.get("AAPL").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let cache = BoundedPriceCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.set(stream("A", 1));
        assert_eq!(
            cache.set(stream("B", 1)),
            SetOutcome::Evicted {
                evicted: "A".to_string()
            }
        );
    }

    #[test]
    fn older_same_source_write_is_rejected() {
        let cache = BoundedPriceCache::new(4);
        assert_eq!(cache.set(stream("AAPL", 200)), SetOutcome::Inserted);
        assert_eq!(
            cache.set(stream("AAPL", 100)),
            SetOutcome::Rejected {
                current_timestamp: 200
            }
        );
        assert_eq!(cache.get("AAPL").unwrap().event_timestamp(), 200);
        assert_eq!(cache.stats().rejected_count, 1);
    }

    #[test]
    fn fallback_never_overwrites_newer_stream_record() {
        let cache = BoundedPriceCache::new(4);
        cache.set(stream("AAPL", 500));

        let outcome = cache.set(rec("AAPL", 400, PriceSource::Fallback));
        assert!(!outcome.is_stored());
        assert_eq!(cache.peek("AAPL").unwrap().source(), PriceSource::Stream);
    }

    #[test]
    fn fallback_replaces_stale_stream_record() {
        let cache = BoundedPriceCache::new(4);
        cache.set(stream("AAPL", 500));

        assert_eq!(
            cache.set(rec("AAPL", 900, PriceSource::Fallback)),
            SetOutcome::Replaced
        );
        assert_eq!(cache.peek("AAPL").unwrap().source(), PriceSource::Fallback);
    }

    #[test]
    fn equal_timestamp_overwrites() {
        let cache = BoundedPriceCache::new(4);
        cache.set(stream("AAPL", 500));
        assert_eq!(
            cache.set(rec("AAPL", 500, PriceSource::Fallback)),
            SetOutcome::Replaced
        );
    }

    #[test]
    fn capacity_two_scenario_evicts_least_recently_used() {
        let cache = BoundedPriceCache::new(2);
        cache.set(stream("A", 100));
        cache.set(stream("B", 100));
        assert!(cache.get("A").is_some());

        assert_eq!(
            cache.set(stream("C", 100)),
            SetOutcome::Evicted {
                evicted: "B".to_string()
            }
        );
        assert!(cache.get("B").is_none());
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[test]
    fn replace_refreshes_recency() {
        let cache = BoundedPriceCache::new(2);
        cache.set(stream("A", 1));
        cache.set(stream("B", 1));
        cache.set(stream("A", 2));
        cache.set(stream("C", 1));

        assert_eq!(cache.symbols_by_recency(), vec!["C", "A"]);
    }

    #[test]
    fn peek_does_not_refresh_recency() {
        let cache = BoundedPriceCache::new(2);
        cache.set(stream("A", 1));
        cache.set(stream("B", 1));
        assert!(cache.peek("A").is_some());
        cache.set(stream("C", 1));

        assert!(cache.peek("A").is_none());
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn purge_removes_exactly_expired_entries() {
        let cache = BoundedPriceCache::new(8);
        cache.set(stream("OLD", 1_000));
        cache.set(stream("EDGE", 5_000));
        cache.set(stream("NEW", 9_000));

        // now = 10_000, max_age = 5s: OLD is 9s old, EDGE exactly 5s, NEW 1s.
        let removed = cache.purge_at(Duration::from_secs(5), 10_000);
        assert_eq!(removed, 1);
        assert!(cache.peek("OLD").is_none());
        assert!(cache.peek("EDGE").is_some());
        assert!(cache.peek("NEW").is_some());

        assert_eq!(cache.purge_at(Duration::from_secs(5), 10_000), 0);
        assert_eq!(cache.stats().purged_count, 1);
    }

    #[test]
    fn purged_slots_are_reused() {
        let cache = BoundedPriceCache::new(3);
        cache.set(stream("A", 1));
        cache.set(stream("B", 1));
        cache.purge_at(Duration::from_millis(0), 10);
        assert!(cache.is_empty());

        cache.set(stream("C", 20));
        cache.set(stream("D", 20));
        cache.set(stream("E", 20));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.symbols_by_recency(), vec!["E", "D", "C"]);
        assert_eq!(cache.stats().eviction_count, 0);
    }

    #[test]
    fn stats_order_entries_by_access_count() {
        let cache = BoundedPriceCache::new(4);
        cache.set(stream("A", 1));
        cache.set(stream("B", 1));
        cache.set(stream("C", 1));
        for _ in 0..3 {
            let _ = cache.get("B");
        }
        let _ = cache.get("C");

        let stats = cache.stats();
        let order: Vec<_> = stats
            .entries_by_access
            .iter()
            .map(|e| (e.symbol.as_str(), e.access_count))
            .collect();
        assert_eq!(order, vec![("B", 3), ("C", 1), ("A", 0)]);
        assert_eq!(stats.size, 3);
        assert_eq!(stats.capacity, 4);
        assert!((stats.hit_rate() - 1.0).abs() < f64::EPSILON);
    }

    // -------------------------------------------------------------------------
    // Model-based properties
    // -------------------------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, i64),
        Get(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, 0i64..50).prop_map(|(s, ts)| Op::Set(s, ts)),
            (0u8..8).prop_map(Op::Get),
        ]
    }

    /// Reference LRU: front of `order` is most recent.
    #[derive(Default)]
    struct Model {
        order: Vec<String>,
        stamps: HashMap<String, i64>,
    }

    impl Model {
        fn touch(&mut self, symbol: &str) {
            self.order.retain(|s| s != symbol);
            self.order.insert(0, symbol.to_string());
        }
    }

    proptest! {
        #[test]
        fn behaves_like_reference_lru(
            capacity in 1usize..5,
            ops in proptest::collection::vec(op_strategy(), 1..80),
        ) {
            let cache = BoundedPriceCache::new(capacity);
            let mut model = Model::default();

            for op in ops {
                match op {
                    Op::Set(s, ts) => {
                        let symbol = format!("S{s}");
                        let outcome = cache.set(stream(&symbol, ts));
                        match model.stamps.get(&symbol).copied() {
                            Some(existing) if existing > ts => {
                                prop_assert_eq!(
                                    outcome,
                                    SetOutcome::Rejected { current_timestamp: existing }
                                );
                            }
                            Some(_) => {
                                prop_assert_eq!(outcome, SetOutcome::Replaced);
                                model.stamps.insert(symbol.clone(), ts);
                                model.touch(&symbol);
                            }
                            None => {
                                if model.order.len() >= capacity {
                                    let victim = model.order.pop().unwrap();
                                    model.stamps.remove(&victim);
                                    prop_assert_eq!(
                                        outcome,
                                        SetOutcome::Evicted { evicted: victim }
                                    );
                                } else {
                                    prop_assert_eq!(outcome, SetOutcome::Inserted);
                                }
                                model.stamps.insert(symbol.clone(), ts);
                                model.touch(&symbol);
                            }
                        }
                    }
                    Op::Get(s) => {
                        let symbol = format!("S{s}");
                        let got = cache.get(&symbol);
                        prop_assert_eq!(got.is_some(), model.stamps.contains_key(&symbol));
                        if let Some(record) = got {
                            prop_assert_eq!(Some(record.event_timestamp()), model.stamps.get(&symbol).copied());
                            model.touch(&symbol);
                        }
                    }
                }

                prop_assert!(cache.len() <= capacity);
                prop_assert_eq!(cache.symbols_by_recency(), model.order.clone());
            }
        }

        #[test]
        fn stored_timestamp_never_decreases(
            stamps in proptest::collection::vec(0i64..1_000, 1..40),
        ) {
            let cache = BoundedPriceCache::new(1);
            let mut high_water = i64::MIN;
            for ts in stamps {
                cache.set(stream("AAPL", ts));
                let stored = cache.peek("AAPL").unwrap().event_timestamp();
                prop_assert!(stored >= high_water);
                high_water = stored;
            }
        }

        #[test]
        fn purge_is_exact_and_idempotent(
            stamps in proptest::collection::vec(0i64..10_000, 1..30),
            max_age_ms in 0u64..10_000,
        ) {
            let now = 10_000i64;
            let cache = BoundedPriceCache::new(64);
            for (i, ts) in stamps.iter().enumerate() {
                cache.set(stream(&format!("S{i}"), *ts));
            }

            let max_age = i64::try_from(max_age_ms).unwrap();
            let expected = stamps.iter().filter(|&&ts| now - ts > max_age).count();
            let removed = cache.purge_at(Duration::from_millis(max_age_ms), now);
            prop_assert_eq!(removed, expected);
            prop_assert_eq!(cache.len(), stamps.len() - expected);
            prop_assert_eq!(cache.purge_at(Duration::from_millis(max_age_ms), now), 0);
        }
    }
}
