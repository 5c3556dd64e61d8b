//! Price Observer Port (Driven Port)
//!
//! Interface for consumers that want every accepted price update.

use async_trait::async_trait;

use crate::domain::price::PriceRecord;

/// Observer failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    /// Observer refused the update.
    #[error("observer rejected update: {0}")]
    Rejected(String),

    /// Observer's downstream is unreachable.
    #[error("observer unavailable: {0}")]
    Unavailable(String),
}

/// Consumer of price updates.
///
/// Each observer is driven by its own worker, so a slow observer delays only
/// itself. Repeated errors get the observer deregistered.
#[async_trait]
pub trait PriceObserver: Send + Sync {
    /// Handle one price update.
    async fn on_price(&self, record: &PriceRecord) -> Result<(), ObserverError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "observer"
    }
}
