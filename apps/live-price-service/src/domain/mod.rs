//! Domain Layer - Core price types and subscription tracking.
//!
//! This layer contains the core domain types for live pricing with no
//! I/O dependencies. All types here are pure Rust with serialization
//! support.

/// Price records and their overwrite rule.
pub mod price;

/// Subscription set grouped by market.
pub mod subscription;
