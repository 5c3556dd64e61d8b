//! Price Records
//!
//! The canonical in-memory representation of an instrument's price at a
//! point in time. Records are immutable: a newer observation for the same
//! symbol supersedes the stored record, it never mutates it.
//!
//! # Overwrite Rule
//!
//! Ordering between two records for the same symbol is decided by event
//! timestamp alone. A candidate replaces the stored record unless the stored
//! record is strictly newer, so a fallback poll can refresh a stale stream
//! record but never clobbers a fresher one.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::Symbol;

// =============================================================================
// Price Source
// =============================================================================

/// Where a price record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Push feed (WebSocket trade message).
    Stream,
    /// Pull-based fallback source.
    Fallback,
}

impl PriceSource {
    /// Get the source name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Price Record
// =============================================================================

/// Immutable snapshot of one instrument's price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    symbol: Symbol,
    price: Decimal,
    volume: u64,
    event_timestamp: i64,
    source: PriceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_percent: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    high: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    low: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ask: Option<Decimal>,
}

impl PriceRecord {
    /// Create a validated price record.
    ///
    /// # Errors
    ///
    /// Returns `PriceRecordError` if the symbol is empty, the price is not
    /// strictly positive, or the timestamp is negative.
    pub fn new(
        symbol: impl Into<Symbol>,
        price: Decimal,
        volume: u64,
        event_timestamp: i64,
        source: PriceSource,
    ) -> Result<Self, PriceRecordError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(PriceRecordError::EmptySymbol);
        }
        if price <= Decimal::ZERO {
            return Err(PriceRecordError::NonPositivePrice { symbol, price });
        }
        if event_timestamp < 0 {
            return Err(PriceRecordError::NegativeTimestamp {
                symbol,
                timestamp: event_timestamp,
            });
        }

        Ok(Self {
            symbol,
            price,
            volume,
            event_timestamp,
            source,
            change: None,
            change_percent: None,
            high: None,
            low: None,
            bid: None,
            ask: None,
        })
    }

    /// Attach the absolute and percentage change.
    #[must_use]
    pub const fn with_change(mut self, change: Decimal, change_percent: Decimal) -> Self {
        self.change = Some(change);
        self.change_percent = Some(change_percent);
        self
    }

    /// Attach the session high and low.
    #[must_use]
    pub const fn with_range(mut self, high: Decimal, low: Decimal) -> Self {
        self.high = Some(high);
        self.low = Some(low);
        self
    }

    /// Attach the best bid and ask.
    #[must_use]
    pub const fn with_quote(mut self, bid: Decimal, ask: Decimal) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self
    }

    /// Instrument symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Last traded or closing price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Traded volume.
    #[must_use]
    pub const fn volume(&self) -> u64 {
        self.volume
    }

    /// Event time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn event_timestamp(&self) -> i64 {
        self.event_timestamp
    }

    /// Event time as a UTC datetime.
    #[must_use]
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.event_timestamp).single()
    }

    /// Record origin.
    #[must_use]
    pub const fn source(&self) -> PriceSource {
        self.source
    }

    /// Absolute change against the reference price, if known.
    #[must_use]
    pub const fn change(&self) -> Option<Decimal> {
        self.change
    }

    /// Percentage change against the reference price, if known.
    #[must_use]
    pub const fn change_percent(&self) -> Option<Decimal> {
        self.change_percent
    }

    /// Session high, if known.
    #[must_use]
    pub const fn high(&self) -> Option<Decimal> {
        self.high
    }

    /// Session low, if known.
    #[must_use]
    pub const fn low(&self) -> Option<Decimal> {
        self.low
    }

    /// Best bid, if known.
    #[must_use]
    pub const fn bid(&self) -> Option<Decimal> {
        self.bid
    }

    /// Best ask, if known.
    #[must_use]
    pub const fn ask(&self) -> Option<Decimal> {
        self.ask
    }

    /// Age of the record relative to `now_ms`, clamped at zero.
    #[must_use]
    pub const fn age_millis(&self, now_ms: i64) -> i64 {
        let age = now_ms.saturating_sub(self.event_timestamp);
        if age < 0 { 0 } else { age }
    }

    /// Whether the record is older than `threshold_ms` at `now_ms`.
    #[must_use]
    pub const fn is_stale(&self, now_ms: i64, threshold_ms: i64) -> bool {
        self.age_millis(now_ms) > threshold_ms
    }

    /// Whether this record may replace `existing` under the timestamp-wins rule.
    #[must_use]
    pub const fn supersedes(&self, existing: &Self) -> bool {
        self.event_timestamp >= existing.event_timestamp
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Errors
// =============================================================================

/// Validation failures when constructing a `PriceRecord`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceRecordError {
    /// Symbol was empty or whitespace.
    #[error("price record symbol cannot be empty")]
    EmptySymbol,

    /// Price was zero or negative.
    #[error("price for {symbol} must be positive, got {price}")]
    NonPositivePrice {
        /// Offending symbol.
        symbol: Symbol,
        /// Offending price.
        price: Decimal,
    },

    /// Timestamp predates the epoch.
    #[error("timestamp for {symbol} cannot be negative, got {timestamp}")]
    NegativeTimestamp {
        /// Offending symbol.
        symbol: Symbol,
        /// Offending timestamp.
        timestamp: i64,
    },
}
