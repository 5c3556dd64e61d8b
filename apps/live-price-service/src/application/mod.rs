//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the price service orchestrator and the port
//! interfaces through which it reaches the fallback source and observers.

/// Port interfaces for external systems (fallback source, observers).
pub mod ports;

/// Application services for price ingestion and retrieval.
pub mod services;
