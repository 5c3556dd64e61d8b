//! Fallback Fetching
//!
//! Batched, bounded-concurrency pulls from a `FallbackSource`. A request is
//! split into sub-batches of `batch_size` symbols; at most `max_concurrency`
//! sub-batches are in flight at once and each runs under its own timeout,
//! so one failing sub-batch never hides prices fetched by the others.
//!
//! A sub-batch that fails outright (anything but a timeout) is retried one
//! symbol at a time, so a single symbol the source rejects only fails
//! itself.

mod http;

pub use http::HttpFallbackSource;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};

use crate::application::ports::{FallbackError, FallbackSource};
use crate::domain::price::PriceRecord;
use crate::domain::subscription::Symbol;
use crate::infrastructure::config::FallbackSettings;
use crate::infrastructure::latency::{LatencySnapshot, LatencyTracker};
use crate::infrastructure::metrics::{self, FallbackOutcome};

/// Result of a batch fetch: a price or an error for every requested symbol.
#[derive(Debug, Default)]
pub struct FallbackBatch {
    /// Prices that were returned.
    pub prices: HashMap<Symbol, PriceRecord>,
    /// Symbols that could not be priced, with the reason.
    pub errors: HashMap<Symbol, FallbackError>,
}

impl FallbackBatch {
    /// Whether every requested symbol was priced.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold one sub-batch outcome in. Records for symbols outside `chunk`
    /// are ignored; requested symbols without a record become `NotFound`.
    fn merge(&mut self, chunk: Vec<Symbol>, outcome: Result<Vec<PriceRecord>, FallbackError>) {
        match outcome {
            Ok(records) => {
                let requested: HashSet<&str> = chunk.iter().map(String::as_str).collect();
                for record in records {
                    if !requested.contains(record.symbol()) {
                        continue;
                    }
                    match self.prices.get(record.symbol()) {
                        Some(existing) if !record.supersedes(existing) => {}
                        _ => {
                            self.prices.insert(record.symbol().to_string(), record);
                        }
                    }
                }
                for symbol in chunk {
                    if !self.prices.contains_key(&symbol) {
                        self.errors.insert(symbol, FallbackError::NotFound);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(symbols = chunk.len(), error = %e, "Fallback sub-batch failed");
                for symbol in chunk {
                    self.errors.insert(symbol, e.clone());
                }
            }
        }
    }
}

type ChunkOutcome = (Vec<Symbol>, Result<Vec<PriceRecord>, FallbackError>);

/// Batched fetcher over a fallback source.
pub struct FallbackFetcher {
    source: Arc<dyn FallbackSource>,
    batch_size: usize,
    max_concurrency: usize,
    request_timeout: Duration,
    latency: LatencyTracker,
}

impl std::fmt::Debug for FallbackFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackFetcher")
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl FallbackFetcher {
    /// Create a fetcher over the given source.
    #[must_use]
    pub fn new(
        source: Arc<dyn FallbackSource>,
        settings: &FallbackSettings,
        latency_capacity: usize,
    ) -> Self {
        Self {
            source,
            batch_size: settings.batch_size.max(1),
            max_concurrency: settings.max_concurrency.max(1),
            request_timeout: settings.request_timeout,
            latency: LatencyTracker::new(latency_capacity),
        }
    }

    /// Fetch prices for `symbols`.
    ///
    /// Duplicates are requested once. Every distinct symbol ends up in
    /// exactly one of `prices` or `errors`.
    pub async fn fetch_batch(&self, symbols: &[Symbol]) -> FallbackBatch {
        let mut seen = HashSet::new();
        let unique: Vec<Symbol> = symbols
            .iter()
            .filter(|symbol| seen.insert(symbol.as_str()))
            .cloned()
            .collect();

        let mut batch = FallbackBatch::default();
        if unique.is_empty() {
            return batch;
        }

        let chunks = unique.chunks(self.batch_size).map(<[Symbol]>::to_vec);
        let mut retry = Vec::new();
        for (chunk, outcome) in self.fetch_chunks(chunks).await {
            match outcome {
                Err(e) if chunk.len() > 1 && !matches!(e, FallbackError::Timeout(_)) => {
                    tracing::warn!(
                        symbols = chunk.len(),
                        error = %e,
                        "Fallback sub-batch failed, retrying symbols individually"
                    );
                    retry.extend(chunk);
                }
                outcome => batch.merge(chunk, outcome),
            }
        }

        if !retry.is_empty() {
            let singles = retry.into_iter().map(|symbol| vec![symbol]);
            for (chunk, outcome) in self.fetch_chunks(singles).await {
                batch.merge(chunk, outcome);
            }
        }

        let not_found = batch
            .errors
            .values()
            .filter(|e| matches!(e, FallbackError::NotFound))
            .count();
        metrics::record_fallback_symbols(FallbackOutcome::Success, batch.prices.len());
        metrics::record_fallback_symbols(FallbackOutcome::NotFound, not_found);
        metrics::record_fallback_symbols(
            FallbackOutcome::Failed,
            batch.errors.len() - not_found,
        );

        tracing::debug!(
            requested = unique.len(),
            fetched = batch.prices.len(),
            failed = batch.errors.len(),
            "Fallback batch complete"
        );
        batch
    }

    async fn fetch_chunks<I>(&self, chunks: I) -> Vec<ChunkOutcome>
    where
        I: Iterator<Item = Vec<Symbol>>,
    {
        stream::iter(chunks)
            .map(|chunk| async move {
                let outcome = self.fetch_chunk(&chunk).await;
                (chunk, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }

    async fn fetch_chunk(&self, chunk: &[Symbol]) -> Result<Vec<PriceRecord>, FallbackError> {
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.request_timeout, self.source.fetch_quotes(chunk)).await
            {
                Ok(result) => result,
                Err(_) => Err(FallbackError::Timeout(self.request_timeout)),
            };
        self.latency.record(started.elapsed(), outcome.is_ok());
        outcome
    }

    /// Latency statistics for fallback requests.
    #[must_use]
    pub fn latency(&self) -> LatencySnapshot {
        self.latency.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::MockFallbackSource;
    use crate::domain::price::PriceSource;

    fn record(symbol: &str, price: &str, ts: i64) -> PriceRecord {
        PriceRecord::new(
            symbol,
            Decimal::from_str(price).unwrap(),
            0,
            ts,
            PriceSource::Fallback,
        )
        .unwrap()
    }

    fn settings(batch_size: usize, max_concurrency: usize) -> FallbackSettings {
        let mut settings = FallbackSettings::new("http://localhost");
        settings.batch_size = batch_size;
        settings.max_concurrency = max_concurrency;
        settings.request_timeout = Duration::from_millis(200);
        settings
    }

    fn symbols(raw: &[&str]) -> Vec<Symbol> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn failed_sub_batch_does_not_hide_others() {
        let mut source = MockFallbackSource::new();
        source.expect_fetch_quotes().times(3).returning(|chunk| {
            if chunk.iter().any(|s| s == "BAD") {
                Err(FallbackError::Http {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(chunk.iter().map(|s| record(s, "10", 1)).collect())
            }
        });

        let fetcher = FallbackFetcher::new(Arc::new(source), &settings(1, 2), 16);
        let batch = fetcher.fetch_batch(&symbols(&["AAPL", "BAD", "MSFT"])).await;

        assert_eq!(batch.prices.len(), 2);
        assert!(batch.prices.contains_key("AAPL"));
        assert!(batch.prices.contains_key("MSFT"));
        assert!(matches!(
            batch.errors.get("BAD"),
            Some(FallbackError::Http { status: 500, .. })
        ));
        assert!(!batch.is_complete());
    }

    #[tokio::test]
    async fn one_bad_symbol_does_not_fail_its_sub_batch() {
        let mut source = MockFallbackSource::new();
        source.expect_fetch_quotes().times(4).returning(|chunk| {
            if chunk.iter().any(|s| s == "Y") {
                Err(FallbackError::Http {
                    status: 404,
                    body: "unknown Y".to_string(),
                })
            } else {
                Ok(chunk.iter().map(|s| record(s, "10", 1)).collect())
            }
        });

        let defaults = FallbackSettings::new("http://localhost");
        assert!(defaults.batch_size >= 3);
        let fetcher = FallbackFetcher::new(Arc::new(source), &defaults, 16);
        let batch = fetcher.fetch_batch(&symbols(&["X", "Y", "Z"])).await;

        assert_eq!(batch.prices.len(), 2);
        assert!(batch.prices.contains_key("X"));
        assert!(batch.prices.contains_key("Z"));
        assert_eq!(batch.errors.len(), 1);
        assert!(matches!(
            batch.errors.get("Y"),
            Some(FallbackError::Http { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn timed_out_sub_batch_is_not_retried() {
        let source = Arc::new(SlowSource {
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let fetcher = FallbackFetcher::new(source.clone(), &settings(10, 4), 16);

        let batch = fetcher.fetch_batch(&symbols(&["SLOW", "FAST"])).await;

        assert!(batch.prices.is_empty());
        assert_eq!(batch.errors.len(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_symbols_are_not_found() {
        let mut source = MockFallbackSource::new();
        source
            .expect_fetch_quotes()
            .times(1)
            .returning(|_| Ok(vec![record("AAPL", "10", 1), record("EXTRA", "1", 1)]));

        let fetcher = FallbackFetcher::new(Arc::new(source), &settings(10, 1), 16);
        let batch = fetcher.fetch_batch(&symbols(&["AAPL", "NOPE"])).await;

        assert_eq!(batch.prices.len(), 1);
        assert!(!batch.prices.contains_key("EXTRA"));
        assert_eq!(batch.errors.get("NOPE"), Some(&FallbackError::NotFound));
    }

    #[tokio::test]
    async fn duplicates_are_requested_once() {
        let mut source = MockFallbackSource::new();
        source
            .expect_fetch_quotes()
            .withf(|chunk: &[Symbol]| chunk.len() == 2)
            .times(1)
            .returning(|chunk| Ok(chunk.iter().map(|s| record(s, "5", 1)).collect()));

        let fetcher = FallbackFetcher::new(Arc::new(source), &settings(10, 1), 16);
        let batch = fetcher
            .fetch_batch(&symbols(&["AAPL", "AAPL", "MSFT", "AAPL"]))
            .await;
        assert_eq!(batch.prices.len(), 2);
        assert!(batch.is_complete());
    }

    #[tokio::test]
    async fn newest_duplicate_record_wins() {
        let mut source = MockFallbackSource::new();
        source
            .expect_fetch_quotes()
            .returning(|_| Ok(vec![record("AAPL", "10", 5), record("AAPL", "9", 2)]));

        let fetcher = FallbackFetcher::new(Arc::new(source), &settings(10, 1), 16);
        let batch = fetcher.fetch_batch(&symbols(&["AAPL"])).await;
        assert_eq!(batch.prices["AAPL"].event_timestamp(), 5);
    }

    #[tokio::test]
    async fn empty_request_makes_no_calls() {
        let source = MockFallbackSource::new();
        let fetcher = FallbackFetcher::new(Arc::new(source), &settings(10, 1), 16);
        let batch = fetcher.fetch_batch(&[]).await;
        assert!(batch.prices.is_empty());
        assert!(batch.errors.is_empty());
    }

    struct SlowSource {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FallbackSource for SlowSource {
        async fn fetch_quotes(
            &self,
            symbols: &[Symbol],
        ) -> Result<Vec<PriceRecord>, FallbackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if symbols.iter().any(|s| s == "SLOW") {
                tokio::time::sleep(self.delay).await;
            }
            Ok(symbols.iter().map(|s| record(s, "1", 1)).collect())
        }
    }

    #[tokio::test]
    async fn slow_sub_batch_times_out_alone() {
        let source = Arc::new(SlowSource {
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let fetcher = FallbackFetcher::new(source.clone(), &settings(1, 4), 16);

        let started = Instant::now();
        let batch = fetcher.fetch_batch(&symbols(&["SLOW", "FAST"])).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(batch.prices.contains_key("FAST"));
        assert_eq!(
            batch.errors.get("SLOW"),
            Some(&FallbackError::Timeout(Duration::from_millis(200)))
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let latency = fetcher.latency();
        assert_eq!(latency.sample_count, 2);
        assert!((latency.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
