//! Service Configuration Settings
//!
//! Configuration types for the live price service, loaded from environment
//! variables prefixed with `LIVE_PRICES_`.

use std::time::Duration;

use reqwest::Url;

use crate::domain::subscription::{DEFAULT_MARKET, Market, Symbol, SymbolError, validate_symbol};

/// Lookup function used to read configuration values.
pub type EnvSource<'a> = &'a dyn Fn(&str) -> Option<String>;

// =============================================================================
// Secrets
// =============================================================================

/// Opaque credential string, redacted in `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    /// Expose the credential.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether no credential is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(\"\")")
        } else {
            f.write_str("Secret([REDACTED])")
        }
    }
}

// =============================================================================
// Feed Settings
// =============================================================================

/// Push feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Credential appended as the `token` query parameter.
    pub token: Secret,
    /// Interval between outbound pings and heartbeat checks.
    pub heartbeat_interval: Duration,
    /// Silence after which the session is considered stale.
    pub heartbeat_timeout: Duration,
    /// Missed heartbeats tolerated before the supervisor forces a reconnect.
    pub max_missed_heartbeats: u32,
    /// Interval between supervisor health checks.
    pub health_check_interval: Duration,
    /// Base reconnect delay.
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max: Duration,
    /// Jitter fraction applied to reconnect delays (0 disables jitter).
    pub reconnect_jitter: f64,
    /// Consecutive failed reconnects before the feed is declared unavailable.
    pub max_reconnect_attempts: u32,
    /// Interval between full re-subscriptions.
    pub resubscribe_interval: Duration,
    /// Symbols per subscribe message.
    pub subscribe_batch_size: usize,
    /// Pause between subscribe batches.
    pub subscribe_batch_delay: Duration,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl FeedSettings {
    /// Settings with defaults for the given endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: Secret::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_missed_heartbeats: 3,
            health_check_interval: Duration::from_secs(60),
            reconnect_base: Duration::from_millis(5_000),
            reconnect_max: Duration::from_secs(60),
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 10,
            resubscribe_interval: Duration::from_secs(3600),
            subscribe_batch_size: 50,
            subscribe_batch_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Endpoint with the credential attached.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the endpoint is not a valid URL.
    pub fn connect_url(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidValue {
            key: "LIVE_PRICES_FEED_URL".to_string(),
            reason: e.to_string(),
        })?;
        if !self.token.is_empty() {
            url.query_pairs_mut()
                .append_pair("token", self.token.expose());
        }
        Ok(url.into())
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Cache and maintenance loop settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Maximum number of cached symbols.
    pub capacity: usize,
    /// Age after which a record is backfilled from the fallback source.
    pub staleness_threshold: Duration,
    /// Age after which a record is purged.
    pub max_age: Duration,
    /// Interval between purges.
    pub purge_interval: Duration,
    /// Interval between staleness backfill sweeps.
    pub backfill_interval: Duration,
    /// Samples kept by each latency tracker.
    pub latency_buffer_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            staleness_threshold: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(300),
            backfill_interval: Duration::from_secs(30),
            latency_buffer_size: 1000,
        }
    }
}

// =============================================================================
// Fallback Settings
// =============================================================================

/// Pull-based fallback source settings.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Base URL of the quote endpoint.
    pub base_url: String,
    /// Optional API key sent as `X-API-Key`.
    pub api_key: Secret,
    /// Symbols per request.
    pub batch_size: usize,
    /// Requests in flight at once.
    pub max_concurrency: usize,
    /// Timeout per request.
    pub request_timeout: Duration,
    /// Deadline for synchronous gap fills in `get_all_prices`.
    pub gap_fill_timeout: Duration,
    /// Deadline for the cache warm-up on start.
    pub warmup_timeout: Duration,
}

impl FallbackSettings {
    /// Settings with defaults for the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Secret::default(),
            batch_size: 20,
            max_concurrency: 4,
            request_timeout: Duration::from_secs(10),
            gap_fill_timeout: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Subscriber and Server Settings
// =============================================================================

/// Observer fan-out settings.
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Pending updates kept per observer.
    pub queue_capacity: usize,
    /// Consecutive observer errors before deregistration.
    pub max_consecutive_failures: u32,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_consecutive_failures: 3,
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Hard deadline for joining background tasks on stop.
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Service Configuration
// =============================================================================

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Push feed settings; `None` runs on the fallback source alone.
    pub feed: Option<FeedSettings>,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Fallback source settings.
    pub fallback: FallbackSettings,
    /// Observer settings.
    pub subscribers: SubscriberSettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Initial symbol universe grouped by market.
    pub universe: Vec<(Market, Vec<Symbol>)>,
}

impl ServiceConfig {
    /// Configuration with defaults, no push feed and an empty universe.
    #[must_use]
    pub fn new(fallback_url: impl Into<String>) -> Self {
        Self {
            feed: None,
            cache: CacheSettings::default(),
            fallback: FallbackSettings::new(fallback_url),
            subscribers: SubscriberSettings::default(),
            server: ServerSettings::default(),
            universe: Vec::new(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or the result fails
    /// validation.
    pub fn from_source(source: EnvSource<'_>) -> Result<Self, ConfigError> {
        let fallback_url = source("LIVE_PRICES_FALLBACK_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("LIVE_PRICES_FALLBACK_URL".to_string()))?;
        if fallback_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue(
                "LIVE_PRICES_FALLBACK_URL".to_string(),
            ));
        }

        let feed = source("LIVE_PRICES_FEED_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| feed_settings(source, url));

        let cache_defaults = CacheSettings::default();
        let cache = CacheSettings {
            capacity: parse_env_usize(
                source,
                "LIVE_PRICES_CACHE_CAPACITY",
                cache_defaults.capacity,
            ),
            staleness_threshold: parse_env_duration_secs(
                source,
                "LIVE_PRICES_STALENESS_SECS",
                cache_defaults.staleness_threshold,
            ),
            max_age: parse_env_duration_secs(
                source,
                "LIVE_PRICES_CACHE_MAX_AGE_SECS",
                cache_defaults.max_age,
            ),
            purge_interval: parse_env_duration_secs(
                source,
                "LIVE_PRICES_PURGE_INTERVAL_SECS",
                cache_defaults.purge_interval,
            ),
            backfill_interval: parse_env_duration_secs(
                source,
                "LIVE_PRICES_BACKFILL_INTERVAL_SECS",
                cache_defaults.backfill_interval,
            ),
            latency_buffer_size: parse_env_usize(
                source,
                "LIVE_PRICES_LATENCY_BUFFER_SIZE",
                cache_defaults.latency_buffer_size,
            ),
        };

        let fallback_defaults = FallbackSettings::new(fallback_url.trim());
        let fallback = FallbackSettings {
            api_key: Secret::new(source("LIVE_PRICES_FALLBACK_API_KEY").unwrap_or_default()),
            batch_size: parse_env_usize(
                source,
                "LIVE_PRICES_FALLBACK_BATCH_SIZE",
                fallback_defaults.batch_size,
            ),
            max_concurrency: parse_env_usize(
                source,
                "LIVE_PRICES_FALLBACK_CONCURRENCY",
                fallback_defaults.max_concurrency,
            ),
            request_timeout: parse_env_duration_secs(
                source,
                "LIVE_PRICES_FALLBACK_TIMEOUT_SECS",
                fallback_defaults.request_timeout,
            ),
            gap_fill_timeout: parse_env_duration_secs(
                source,
                "LIVE_PRICES_GAP_FILL_TIMEOUT_SECS",
                fallback_defaults.gap_fill_timeout,
            ),
            warmup_timeout: parse_env_duration_secs(
                source,
                "LIVE_PRICES_WARMUP_TIMEOUT_SECS",
                fallback_defaults.warmup_timeout,
            ),
            ..fallback_defaults
        };

        let subscriber_defaults = SubscriberSettings::default();
        let subscribers = SubscriberSettings {
            queue_capacity: parse_env_usize(
                source,
                "LIVE_PRICES_OBSERVER_QUEUE_CAPACITY",
                subscriber_defaults.queue_capacity,
            ),
            max_consecutive_failures: parse_env_u32(
                source,
                "LIVE_PRICES_OBSERVER_MAX_FAILURES",
                subscriber_defaults.max_consecutive_failures,
            ),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: parse_env_u16(
                source,
                "LIVE_PRICES_HEALTH_PORT",
                server_defaults.health_port,
            ),
            shutdown_timeout: parse_env_duration_secs(
                source,
                "LIVE_PRICES_SHUTDOWN_TIMEOUT_SECS",
                server_defaults.shutdown_timeout,
            ),
        };

        let universe = parse_universe(&source("LIVE_PRICES_SYMBOLS").unwrap_or_default())?;

        let config = Self {
            feed,
            cache,
            fallback,
            subscribers,
            server,
            universe,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("LIVE_PRICES_CACHE_CAPACITY", self.cache.capacity)?;
        non_zero(
            "LIVE_PRICES_LATENCY_BUFFER_SIZE",
            self.cache.latency_buffer_size,
        )?;
        non_zero("LIVE_PRICES_FALLBACK_BATCH_SIZE", self.fallback.batch_size)?;
        non_zero(
            "LIVE_PRICES_FALLBACK_CONCURRENCY",
            self.fallback.max_concurrency,
        )?;
        non_zero(
            "LIVE_PRICES_OBSERVER_QUEUE_CAPACITY",
            self.subscribers.queue_capacity,
        )?;

        non_zero_duration("LIVE_PRICES_PURGE_INTERVAL_SECS", self.cache.purge_interval)?;
        non_zero_duration(
            "LIVE_PRICES_BACKFILL_INTERVAL_SECS",
            self.cache.backfill_interval,
        )?;

        Url::parse(&self.fallback.base_url).map_err(|e| ConfigError::InvalidValue {
            key: "LIVE_PRICES_FALLBACK_URL".to_string(),
            reason: e.to_string(),
        })?;

        if let Some(feed) = &self.feed {
            feed.connect_url()?;
            non_zero(
                "LIVE_PRICES_SUBSCRIBE_BATCH_SIZE",
                feed.subscribe_batch_size,
            )?;
            non_zero_duration(
                "LIVE_PRICES_HEARTBEAT_INTERVAL_SECS",
                feed.heartbeat_interval,
            )?;
            non_zero_duration(
                "LIVE_PRICES_HEALTH_CHECK_INTERVAL_SECS",
                feed.health_check_interval,
            )?;
            non_zero_duration(
                "LIVE_PRICES_RESUBSCRIBE_INTERVAL_SECS",
                feed.resubscribe_interval,
            )?;
            if feed.reconnect_max < feed.reconnect_base {
                return Err(ConfigError::InvalidValue {
                    key: "LIVE_PRICES_RECONNECT_MAX_SECS".to_string(),
                    reason: "must not be below LIVE_PRICES_RECONNECT_BASE_MS".to_string(),
                });
            }
            if feed.heartbeat_timeout < feed.heartbeat_interval {
                return Err(ConfigError::InvalidValue {
                    key: "LIVE_PRICES_HEARTBEAT_TIMEOUT_SECS".to_string(),
                    reason: "must not be below LIVE_PRICES_HEARTBEAT_INTERVAL_SECS".to_string(),
                });
            }
            if !(0.0..=1.0).contains(&feed.reconnect_jitter) {
                return Err(ConfigError::InvalidValue {
                    key: "LIVE_PRICES_RECONNECT_JITTER".to_string(),
                    reason: "must be between 0 and 1".to_string(),
                });
            }
        }

        for (_, symbols) in &self.universe {
            for symbol in symbols {
                validate_symbol(symbol)?;
            }
        }
        Ok(())
    }

    /// Every symbol in the initial universe.
    #[must_use]
    pub fn universe_len(&self) -> usize {
        self.universe.iter().map(|(_, symbols)| symbols.len()).sum()
    }
}

fn feed_settings(source: EnvSource<'_>, url: String) -> FeedSettings {
    let defaults = FeedSettings::new(url.trim());
    FeedSettings {
        token: Secret::new(source("LIVE_PRICES_FEED_TOKEN").unwrap_or_default()),
        heartbeat_interval: parse_env_duration_secs(
            source,
            "LIVE_PRICES_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval,
        ),
        heartbeat_timeout: parse_env_duration_secs(
            source,
            "LIVE_PRICES_HEARTBEAT_TIMEOUT_SECS",
            defaults.heartbeat_timeout,
        ),
        max_missed_heartbeats: parse_env_u32(
            source,
            "LIVE_PRICES_MAX_MISSED_HEARTBEATS",
            defaults.max_missed_heartbeats,
        ),
        health_check_interval: parse_env_duration_secs(
            source,
            "LIVE_PRICES_HEALTH_CHECK_INTERVAL_SECS",
            defaults.health_check_interval,
        ),
        reconnect_base: parse_env_duration_millis(
            source,
            "LIVE_PRICES_RECONNECT_BASE_MS",
            defaults.reconnect_base,
        ),
        reconnect_max: parse_env_duration_secs(
            source,
            "LIVE_PRICES_RECONNECT_MAX_SECS",
            defaults.reconnect_max,
        ),
        reconnect_jitter: parse_env_f64(
            source,
            "LIVE_PRICES_RECONNECT_JITTER",
            defaults.reconnect_jitter,
        ),
        max_reconnect_attempts: parse_env_u32(
            source,
            "LIVE_PRICES_MAX_RECONNECT_ATTEMPTS",
            defaults.max_reconnect_attempts,
        ),
        resubscribe_interval: parse_env_duration_secs(
            source,
            "LIVE_PRICES_RESUBSCRIBE_INTERVAL_SECS",
            defaults.resubscribe_interval,
        ),
        subscribe_batch_size: parse_env_usize(
            source,
            "LIVE_PRICES_SUBSCRIBE_BATCH_SIZE",
            defaults.subscribe_batch_size,
        ),
        subscribe_batch_delay: parse_env_duration_millis(
            source,
            "LIVE_PRICES_SUBSCRIBE_BATCH_DELAY_MS",
            defaults.subscribe_batch_delay,
        ),
        connect_timeout: parse_env_duration_secs(
            source,
            "LIVE_PRICES_CONNECT_TIMEOUT_SECS",
            defaults.connect_timeout,
        ),
        ..defaults
    }
}

/// Parse `market=A,B;market2=C`. Groups without a market name use the
/// default market.
///
/// # Errors
///
/// Returns `ConfigError::InvalidSymbol` for the first malformed symbol.
pub fn parse_universe(raw: &str) -> Result<Vec<(Market, Vec<Symbol>)>, ConfigError> {
    let mut universe: Vec<(Market, Vec<Symbol>)> = Vec::new();

    for group in raw.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let (market, list) = match group.split_once('=') {
            Some((market, list)) if !market.trim().is_empty() => (market.trim(), list),
            Some((_, list)) => (DEFAULT_MARKET, list),
            None => (DEFAULT_MARKET, group),
        };

        let symbols = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(validate_symbol)
            .collect::<Result<Vec<_>, _>>()?;

        match universe.iter_mut().find(|(m, _)| m == market) {
            Some((_, existing)) => existing.extend(symbols),
            None => universe.push((market.to_string(), symbols)),
        }
    }

    Ok(universe)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Symbol universe contains a malformed symbol.
    #[error("invalid symbol in universe: {0}")]
    InvalidSymbol(#[from] SymbolError),
}

fn non_zero(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn non_zero_duration(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn parse_env_u16(source: EnvSource<'_>, key: &str, default: u16) -> u16 {
    source(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(source: EnvSource<'_>, key: &str, default: u32) -> u32 {
    source(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(source: EnvSource<'_>, key: &str, default: usize) -> usize {
    source(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(source: EnvSource<'_>, key: &str, default: f64) -> f64 {
    source(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(source: EnvSource<'_>, key: &str, default: Duration) -> Duration {
    source(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(source: EnvSource<'_>, key: &str, default: Duration) -> Duration {
    source(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
