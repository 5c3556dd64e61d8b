//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FallbackSource`: pull-based batch quote source
//! - `PriceObserver`: consumer notified of every accepted price

mod fallback_source_port;
mod price_observer_port;

#[cfg(test)]
pub use fallback_source_port::MockFallbackSource;
pub use fallback_source_port::{FallbackError, FallbackSource};
pub use price_observer_port::{ObserverError, PriceObserver};
