//! Config loading: defaults, overrides, and validation errors.

use relay::config::{load_config_from_path, load_config_from_str, ConfigError};
use std::path::Path;
use std::time::Duration;

#[test]
fn minimal_config_uses_documented_defaults() {
    let cfg = load_config_from_str("schema_version = 1").unwrap();
    assert_eq!(cfg.bus.host, "localhost");
    assert_eq!(cfg.bus.port, 6379);
    assert_eq!(cfg.bus.max_connections, 20);
    assert_eq!(cfg.bus.socket_timeout, Duration::from_secs(2));
    assert_eq!(cfg.bus.socket_connect_timeout, Duration::from_secs(1));
    assert_eq!(cfg.bus.health_check_interval, Duration::from_secs(15));
    assert_eq!(cfg.cache.pattern_ttl_secs, 3600);
    assert_eq!(cfg.cache.api_response_ttl_secs, 30);
    assert_eq!(cfg.cache.index_ttl_secs, 3600);
    assert_eq!(cfg.channels.patterns, "tickstock.events.patterns");
    assert_eq!(
        cfg.channels.backtest_progress,
        "tickstock.events.backtesting.progress"
    );
    assert_eq!(
        cfg.channels.backtest_results,
        "tickstock.events.backtesting.results"
    );
    assert_eq!(cfg.channels.health, "tickstock.health.status");
    assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
    assert_eq!(cfg.watchlist_refresh, Duration::from_secs(300));
    assert_eq!(cfg.max_offline_per_user, 1000);
}

#[test]
fn full_override_round_trips() {
    let cfg = load_config_from_str(
        r#"
        schema_version = 1

        [bus]
        host = "bus.internal"
        port = 6380
        db = 2
        password = "secret"
        max_connections = 40
        socket_timeout_ms = 500
        socket_connect_timeout_ms = 250
        health_check_interval_secs = 5

        [cache]
        pattern_ttl_secs = 600
        api_response_ttl_secs = 10
        index_ttl_secs = 600

        [channels]
        patterns = "alt.patterns"

        [subscriber]
        heartbeat_interval_secs = 30

        [watchlist]
        refresh_secs = 60

        [offline]
        max_per_user = 50

        [edge]
        bind = "127.0.0.1:9000"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.bus.host, "bus.internal");
    assert_eq!(cfg.bus.port, 6380);
    assert_eq!(cfg.bus.db, 2);
    assert_eq!(cfg.bus.password.as_deref(), Some("secret"));
    assert_eq!(cfg.bus.max_connections, 40);
    assert_eq!(cfg.bus.socket_timeout, Duration::from_millis(500));
    assert_eq!(cfg.cache.pattern_ttl_secs, 600);
    assert_eq!(cfg.channels.patterns, "alt.patterns");
    // Unspecified channels keep their defaults.
    assert_eq!(cfg.channels.health, "tickstock.health.status");
    assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(cfg.watchlist_refresh, Duration::from_secs(60));
    assert_eq!(cfg.max_offline_per_user, 50);
    assert_eq!(cfg.edge_bind, "127.0.0.1:9000");
}

#[test]
fn missing_schema_version_is_rejected() {
    let err = load_config_from_str("[bus]\nhost = \"x\"").unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(_)));
}

#[test]
fn wrong_schema_version_is_rejected() {
    let err = load_config_from_str("schema_version = 2").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)));
}

#[test]
fn zero_ttls_are_rejected() {
    let err = load_config_from_str(
        "schema_version = 1\n[cache]\npattern_ttl_secs = 0",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)));
}

#[test]
fn empty_channel_names_are_rejected() {
    let err = load_config_from_str(
        "schema_version = 1\n[channels]\npatterns = \"\"",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)));
}

#[test]
fn zero_pool_size_is_rejected() {
    let err = load_config_from_str(
        "schema_version = 1\n[bus]\nmax_connections = 0",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)));
}

#[test]
fn unparseable_toml_is_rejected() {
    let err = load_config_from_str("schema_version = [").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn missing_config_file_falls_back_to_defaults() {
    let cfg = load_config_from_path(Path::new("/nonexistent/relay.toml")).unwrap();
    assert_eq!(cfg.bus.host, "localhost");
    assert_eq!(cfg.max_offline_per_user, 1000);
}
