//! Relay configuration loading.
//!
//! TOML is the sole config source.  Every field has a default; a missing
//! config file yields the default configuration.  When a file is present
//! it must carry `schema_version = 1`.
//!
//! Default config path: `/etc/relay/relay.toml`.

use relay_bus::BusConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bus: BusConfig,
    pub cache: CacheSettings,
    pub channels: Channels,
    /// Subscriber heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Watchlist snapshot refresh cadence.
    pub watchlist_refresh: Duration,
    /// Cap on queued offline messages per user; excess drops the oldest.
    pub max_offline_per_user: u64,
    /// Bind address of the HTTP/WS edge.
    pub edge_bind: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Record and index TTL.
    pub pattern_ttl_secs: u64,
    /// Response cache TTL.
    pub api_response_ttl_secs: u64,
    /// Refresh TTL applied to index keys on each write.
    pub index_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            pattern_ttl_secs: 3600,
            api_response_ttl_secs: 30,
            index_ttl_secs: 3600,
        }
    }
}

/// Ingress channel names.  Defaults interoperate with the producer.
#[derive(Debug, Clone)]
pub struct Channels {
    pub patterns: String,
    pub backtest_progress: String,
    pub backtest_results: String,
    pub health: String,
    /// Dashboard side-channel carrying `watchlist_update` events.
    pub dashboard: String,
}

impl Default for Channels {
    fn default() -> Self {
        Channels {
            patterns: relay_protocol::channels::PATTERNS.to_owned(),
            backtest_progress: relay_protocol::channels::BACKTEST_PROGRESS.to_owned(),
            backtest_results: relay_protocol::channels::BACKTEST_RESULTS.to_owned(),
            health: relay_protocol::channels::HEALTH.to_owned(),
            dashboard: "tickstock.events.dashboard".to_owned(),
        }
    }
}

impl Channels {
    /// The full subscription set.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.patterns.clone(),
            self.backtest_progress.clone(),
            self.backtest_results.clone(),
            self.health.clone(),
            self.dashboard.clone(),
        ]
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bus: BusConfig::default(),
            cache: CacheSettings::default(),
            channels: Channels::default(),
            heartbeat_interval: Duration::from_secs(60),
            watchlist_refresh: Duration::from_secs(300),
            max_offline_per_user: 1000,
            edge_bind: "0.0.0.0:8400".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    bus: Option<RawBusConfig>,
    cache: Option<RawCacheConfig>,
    channels: Option<RawChannels>,
    subscriber: Option<RawSubscriberConfig>,
    watchlist: Option<RawWatchlistConfig>,
    offline: Option<RawOfflineConfig>,
    edge: Option<RawEdgeConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    host: Option<String>,
    port: Option<u16>,
    db: Option<i64>,
    password: Option<String>,
    max_connections: Option<usize>,
    socket_timeout_ms: Option<u64>,
    socket_connect_timeout_ms: Option<u64>,
    health_check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCacheConfig {
    pattern_ttl_secs: Option<u64>,
    api_response_ttl_secs: Option<u64>,
    index_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChannels {
    patterns: Option<String>,
    backtest_progress: Option<String>,
    backtest_results: Option<String>,
    health: Option<String>,
    dashboard: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriberConfig {
    heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawWatchlistConfig {
    refresh_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawOfflineConfig {
    max_per_user: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEdgeConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path; a missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/relay/relay.toml`.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/relay/relay.toml"))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let defaults = RelayConfig::default();

    let bus = match raw.bus {
        Some(b) => BusConfig {
            host: b.host.unwrap_or(defaults.bus.host),
            port: b.port.unwrap_or(defaults.bus.port),
            db: b.db.unwrap_or(defaults.bus.db),
            password: b.password,
            max_connections: b.max_connections.unwrap_or(defaults.bus.max_connections),
            socket_timeout: b
                .socket_timeout_ms
                .map_or(defaults.bus.socket_timeout, Duration::from_millis),
            socket_connect_timeout: b
                .socket_connect_timeout_ms
                .map_or(defaults.bus.socket_connect_timeout, Duration::from_millis),
            health_check_interval: b
                .health_check_interval_secs
                .map_or(defaults.bus.health_check_interval, Duration::from_secs),
        },
        None => defaults.bus,
    };
    if bus.max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "bus.max_connections must be at least 1".to_owned(),
        ));
    }

    let cache = match raw.cache {
        Some(c) => CacheSettings {
            pattern_ttl_secs: c.pattern_ttl_secs.unwrap_or(3600),
            api_response_ttl_secs: c.api_response_ttl_secs.unwrap_or(30),
            index_ttl_secs: c.index_ttl_secs.unwrap_or(3600),
        },
        None => CacheSettings::default(),
    };
    if cache.pattern_ttl_secs == 0 || cache.api_response_ttl_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "cache TTLs must be non-zero".to_owned(),
        ));
    }

    let channel_defaults = Channels::default();
    let channels = match raw.channels {
        Some(c) => Channels {
            patterns: c.patterns.unwrap_or(channel_defaults.patterns),
            backtest_progress: c
                .backtest_progress
                .unwrap_or(channel_defaults.backtest_progress),
            backtest_results: c
                .backtest_results
                .unwrap_or(channel_defaults.backtest_results),
            health: c.health.unwrap_or(channel_defaults.health),
            dashboard: c.dashboard.unwrap_or(channel_defaults.dashboard),
        },
        None => channel_defaults,
    };
    for (name, value) in [
        ("channels.patterns", &channels.patterns),
        ("channels.backtest_progress", &channels.backtest_progress),
        ("channels.backtest_results", &channels.backtest_results),
        ("channels.health", &channels.health),
        ("channels.dashboard", &channels.dashboard),
    ] {
        if value.is_empty() {
            return Err(ConfigError::InvalidValue(format!("{} is empty", name)));
        }
    }

    Ok(RelayConfig {
        bus,
        cache,
        channels,
        heartbeat_interval: raw
            .subscriber
            .and_then(|s| s.heartbeat_interval_secs)
            .map_or(defaults.heartbeat_interval, Duration::from_secs),
        watchlist_refresh: raw
            .watchlist
            .and_then(|w| w.refresh_secs)
            .map_or(defaults.watchlist_refresh, Duration::from_secs),
        max_offline_per_user: raw
            .offline
            .and_then(|o| o.max_per_user)
            .unwrap_or(defaults.max_offline_per_user),
        edge_bind: raw.edge.and_then(|e| e.bind).unwrap_or(defaults.edge_bind),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
