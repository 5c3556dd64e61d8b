//! Subscription Set
//!
//! Tracks the symbols the service is interested in, partitioned by market
//! grouping (e.g. `stocks`, `crypto`). The set is shared between the
//! connection supervisor (to replay subscriptions after a reconnect) and the
//! fallback backfill loop (to know what to pull).
//!
//! # Design
//!
//! A symbol belongs to at most one market. Mutations report only the
//! symbols whose membership actually changed, so callers can send minimal
//! incremental control messages upstream.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// A symbol string (stock ticker, `EXCHANGE:PAIR` crypto symbol, ...).
pub type Symbol = String;

/// Market grouping name.
pub type Market = String;

/// Market used when callers do not name one.
pub const DEFAULT_MARKET: &str = "default";

/// Maximum accepted symbol length.
const MAX_SYMBOL_LEN: usize = 32;

/// Validate and normalize a symbol.
///
/// Surrounding whitespace is trimmed. Symbols must be non-empty, at most 32
/// characters, and consist of ASCII alphanumerics or `. - _ : / ^ =`.
///
/// # Errors
///
/// Returns `SymbolError` describing the first violation.
pub fn validate_symbol(raw: &str) -> Result<Symbol, SymbolError> {
    let symbol = raw.trim();
    if symbol.is_empty() {
        return Err(SymbolError::Empty);
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        return Err(SymbolError::TooLong {
            symbol: symbol.to_string(),
            max: MAX_SYMBOL_LEN,
        });
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '/' | '^' | '=')
    };
    if let Some(c) = symbol.chars().find(|&c| !allowed(c)) {
        return Err(SymbolError::InvalidCharacter {
            symbol: symbol.to_string(),
            character: c,
        });
    }
    Ok(symbol.to_string())
}

/// Validate a list of symbols, rejecting an empty list.
///
/// # Errors
///
/// Returns `SymbolError::EmptyList` for an empty input or the first
/// per-symbol validation error.
pub fn validate_symbols<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Symbol>, SymbolError> {
    if raw.is_empty() {
        return Err(SymbolError::EmptyList);
    }
    raw.iter().map(|s| validate_symbol(s.as_ref())).collect()
}

/// Symbol validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Empty symbol.
    #[error("symbol cannot be empty")]
    Empty,
    /// No symbols supplied.
    #[error("symbol list cannot be empty")]
    EmptyList,
    /// Symbol exceeds the length limit.
    #[error("symbol {symbol} exceeds {max} characters")]
    TooLong {
        /// Offending symbol.
        symbol: Symbol,
        /// Length limit.
        max: usize,
    },
    /// Symbol contains a disallowed character.
    #[error("symbol {symbol} contains invalid character {character:?}")]
    InvalidCharacter {
        /// Offending symbol.
        symbol: Symbol,
        /// First disallowed character.
        character: char,
    },
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Membership changes produced by a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Symbols newly added.
    pub subscribe: Vec<Symbol>,
    /// Symbols removed.
    pub unsubscribe: Vec<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

// =============================================================================
// Subscription Set
// =============================================================================

#[derive(Debug, Default)]
struct SetState {
    markets: BTreeMap<Market, BTreeSet<Symbol>>,
}

impl SetState {
    fn market_of(&self, symbol: &str) -> Option<&Market> {
        self.markets
            .iter()
            .find(|(_, symbols)| symbols.contains(symbol))
            .map(|(market, _)| market)
    }

    fn len(&self) -> usize {
        self.markets.values().map(BTreeSet::len).sum()
    }
}

/// Thread-safe set of subscribed symbols grouped by market.
///
/// # Example
///
/// ```rust
/// use live_price_service::domain::subscription::SubscriptionSet;
///
/// let set = SubscriptionSet::new();
///
/// let changes = set.add("stocks", &["AAPL".to_string(), "MSFT".to_string()]);
/// assert_eq!(changes.subscribe, vec!["AAPL", "MSFT"]);
///
/// // Already present - nothing to send upstream
/// let changes = set.add("stocks", &["AAPL".to_string()]);
/// assert!(changes.is_empty());
///
/// let changes = set.remove(&["AAPL".to_string()]);
/// assert_eq!(changes.unsubscribe, vec!["AAPL"]);
/// assert_eq!(set.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    state: RwLock<SetState>,
}

impl SubscriptionSet {
    /// Create an empty subscription set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set pre-populated from a market → symbols universe.
    ///
    /// # Errors
    ///
    /// Returns the first symbol validation error.
    pub fn from_universe<'a, I, S>(universe: I) -> Result<Self, SymbolError>
    where
        I: IntoIterator<Item = (&'a str, &'a [S])>,
        S: AsRef<str> + 'a,
    {
        let set = Self::new();
        for (market, symbols) in universe {
            let validated = symbols
                .iter()
                .map(|s| validate_symbol(s.as_ref()))
                .collect::<Result<Vec<_>, _>>()?;
            set.add(market, &validated);
        }
        Ok(set)
    }

    /// Add symbols to a market.
    ///
    /// Symbols already present in any market are left where they are.
    /// Returns the symbols that were newly added, in sorted order.
    pub fn add(&self, market: &str, symbols: &[Symbol]) -> SubscriptionChanges {
        let mut state = self.state.write();
        let mut added = BTreeSet::new();

        for symbol in symbols {
            if state.market_of(symbol).is_some() {
                continue;
            }
            state
                .markets
                .entry(market.to_string())
                .or_default()
                .insert(symbol.clone());
            added.insert(symbol.clone());
        }
        drop(state);

        SubscriptionChanges {
            subscribe: added.into_iter().collect(),
            unsubscribe: Vec::new(),
        }
    }

    /// Remove symbols from whichever market holds them.
    ///
    /// Returns the symbols that were actually removed, in sorted order.
    pub fn remove(&self, symbols: &[Symbol]) -> SubscriptionChanges {
        let mut state = self.state.write();
        let mut removed = BTreeSet::new();

        for symbol in symbols {
            for market_symbols in state.markets.values_mut() {
                if market_symbols.remove(symbol) {
                    removed.insert(symbol.clone());
                    break;
                }
            }
        }
        state.markets.retain(|_, symbols| !symbols.is_empty());
        drop(state);

        SubscriptionChanges {
            subscribe: Vec::new(),
            unsubscribe: removed.into_iter().collect(),
        }
    }

    /// All subscribed symbols across markets, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let state = self.state.read();
        let mut all: Vec<Symbol> = state.markets.values().flatten().cloned().collect();
        drop(state);
        all.sort_unstable();
        all
    }

    /// Symbols subscribed under a market, sorted.
    #[must_use]
    pub fn symbols_in(&self, market: &str) -> Vec<Symbol> {
        self.state
            .read()
            .markets
            .get(market)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Market names with at least one symbol.
    #[must_use]
    pub fn markets(&self) -> Vec<Market> {
        self.state.read().markets.keys().cloned().collect()
    }

    /// Market holding the symbol, if subscribed.
    #[must_use]
    pub fn market_of(&self, symbol: &str) -> Option<Market> {
        self.state.read().market_of(symbol).cloned()
    }

    /// Check whether a symbol is subscribed.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.state.read().market_of(symbol).is_some()
    }

    /// Total number of subscribed symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Check whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-market symbol counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            total_symbols: state.len(),
            by_market: state
                .markets
                .iter()
                .map(|(market, symbols)| (market.clone(), symbols.len()))
                .collect(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of unique symbols.
    pub total_symbols: usize,
    /// Symbol count per market.
    pub by_market: BTreeMap<Market, usize>,
}

// =============================================================================
// Tests
// =============================================================================
