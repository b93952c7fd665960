//! Aggregate health: producer-offline detection and component roll-up.

mod common;

use common::{start_service, unix_now};
use relay::service::HealthStatus;
use relay_bus::Bus;

#[tokio::test]
async fn fresh_producer_heartbeat_reports_healthy() {
    let (bus, service) = start_service(None).await;
    bus.set_ex("producer:heartbeat", &unix_now().to_string(), 120)
        .await
        .unwrap();

    let health = service.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.healthy);
    assert!(health.producer_online);
    assert_eq!(health.components.bus, HealthStatus::Healthy);
    assert_eq!(health.components.pattern_cache, HealthStatus::Healthy);
    assert_eq!(health.components.event_subscriber, HealthStatus::Healthy);

    service.shutdown().await;
}

#[tokio::test]
async fn stale_producer_heartbeat_reports_warning() {
    let (bus, service) = start_service(None).await;
    let stale = unix_now() - 120.0;
    bus.set_ex("producer:heartbeat", &stale.to_string(), 600)
        .await
        .unwrap();

    let health = service.health().await;
    assert!(!health.producer_online);
    assert_eq!(health.status, HealthStatus::Warning);
    assert!(!health.healthy);
    // Everything else stays healthy.
    assert_eq!(health.components.bus, HealthStatus::Healthy);
    assert_eq!(health.components.pattern_cache, HealthStatus::Healthy);

    service.shutdown().await;
}

#[tokio::test]
async fn missing_heartbeat_without_pattern_activity_means_offline() {
    let (_bus, service) = start_service(None).await;
    let health = service.health().await;
    assert!(!health.producer_online);
    assert_eq!(health.status, HealthStatus::Warning);

    service.shutdown().await;
}

#[tokio::test]
async fn recent_pattern_keys_count_as_producer_liveness_fallback() {
    let (bus, service) = start_service(None).await;
    // No heartbeat key, but fresh pattern data in the cache keyspace.
    bus.set_ex("patterns:AAPL:Doji:1900000000", "{}", 3600)
        .await
        .unwrap();

    let health = service.health().await;
    assert!(health.producer_online);

    service.shutdown().await;
}

#[tokio::test]
async fn unreachable_cache_keyspace_reports_error() {
    let (bus, service) = start_service(None).await;
    bus.set_ex("producer:heartbeat", &unix_now().to_string(), 120)
        .await
        .unwrap();

    // Fail the cache health probe (one op, up to three retries).
    bus.fail_next_ops(4);
    let health = service.health().await;
    assert_eq!(health.components.pattern_cache, HealthStatus::Error);
    assert_eq!(health.status, HealthStatus::Error);
    assert!(!health.healthy);

    service.shutdown().await;
}

#[tokio::test]
async fn stopped_subscriber_reports_warning() {
    let (bus, service) = start_service(None).await;
    bus.set_ex("producer:heartbeat", &unix_now().to_string(), 600)
        .await
        .unwrap();
    service.shutdown().await;

    let health = service.health().await;
    assert_eq!(health.components.event_subscriber, HealthStatus::Error);
    assert_eq!(health.status, HealthStatus::Warning);
    assert!(!health.subscriber.stats.is_running);
}
