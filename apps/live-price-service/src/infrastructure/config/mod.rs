//! Configuration Module
//!
//! Environment-driven configuration for the live price service.

mod settings;

pub use settings::{
    CacheSettings, ConfigError, EnvSource, FallbackSettings, FeedSettings, Secret,
    ServerSettings, ServiceConfig, SubscriberSettings, parse_universe,
};
