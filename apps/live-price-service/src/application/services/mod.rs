//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `LivePriceService`: cache, push feed, fallback and observer orchestration
//! - `ServiceMetrics`: point-in-time view of the whole service

mod live_price;
mod service_metrics;

pub use live_price::{LivePriceService, ServiceError};
pub use service_metrics::{FeedStatus, ServiceMetrics};
