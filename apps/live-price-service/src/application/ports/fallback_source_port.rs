//! Fallback Source Port (Driven Port)
//!
//! Interface for pulling the latest prices for a batch of symbols when the
//! push feed is down or a symbol's cached price has gone stale.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::price::PriceRecord;
use crate::domain::subscription::Symbol;

/// Fallback source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// Request could not be sent or the connection failed.
    #[error("fallback network error: {0}")]
    Network(String),

    /// Source answered with a non-success status.
    #[error("fallback HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Response body could not be decoded.
    #[error("fallback response decode error: {0}")]
    Decode(String),

    /// Request exceeded its deadline.
    #[error("fallback request timed out after {0:?}")]
    Timeout(Duration),

    /// Symbol absent from an otherwise successful response.
    #[error("symbol not found in fallback response")]
    NotFound,
}

/// Port for pulling prices on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackSource: Send + Sync {
    /// Fetch the latest price for each symbol in one request.
    ///
    /// Symbols the source does not know are simply absent from the result.
    async fn fetch_quotes(&self, symbols: &[Symbol]) -> Result<Vec<PriceRecord>, FallbackError>;
}
