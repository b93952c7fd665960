//! Expiration: records past `expires_at` are hidden from scans at once
//! and physically removed by the cleanup pass, along with orphaned index
//! entries.

mod common;

use common::{cache_setup, unix_now};
use relay::pattern_cache::keys;
use relay::scan::ScanFilters;
use relay_bus::Bus;
use relay_protocol::parse_pattern_event;
use relay_test_utils::fixtures::PatternEventBuilder;

#[tokio::test]
async fn expired_record_is_hidden_from_scans_before_cleanup() {
    let (_bus, cache, scan) = cache_setup();
    let now = unix_now();

    let raw = PatternEventBuilder::new("AAPL", "Bull_Flag", 0.9)
        .timestamp(now)
        .expires_at(now - 1.0)
        .build();
    cache
        .process_event(&parse_pattern_event(&raw).unwrap())
        .await
        .unwrap();

    // Still physically present.
    let id = format!("AAPL:Bull_Flag:{}", now as i64);
    assert!(cache.load_record(&id).await.unwrap().is_some());

    // But never visible to scans.
    let response = scan.scan(&ScanFilters::default()).await.unwrap();
    assert_eq!(response.pagination.total, 0);
}

#[tokio::test]
async fn cleanup_pass_removes_expired_records_and_their_index_entries() {
    let (bus, cache, _scan) = cache_setup();
    let now = unix_now();

    let expired = PatternEventBuilder::new("AAPL", "Bull_Flag", 0.9)
        .timestamp(now)
        .expires_at(now - 1.0)
        .build();
    cache
        .process_event(&parse_pattern_event(&expired).unwrap())
        .await
        .unwrap();
    let live = PatternEventBuilder::new("TSLA", "Doji", 0.8)
        .timestamp(now)
        .expires_at(now + 3600.0)
        .build();
    cache
        .process_event(&parse_pattern_event(&live).unwrap())
        .await
        .unwrap();

    let removed = cache.cleanup_expired_once().await.unwrap();
    assert_eq!(removed, 1);

    let expired_id = format!("AAPL:Bull_Flag:{}", now as i64);
    assert!(cache.load_record(&expired_id).await.unwrap().is_none());
    assert_eq!(bus.zcard(keys::CONFIDENCE_INDEX).await.unwrap(), 1);
    assert_eq!(bus.zcard(keys::SYMBOL_INDEX).await.unwrap(), 1);
    assert_eq!(bus.zcard(keys::PATTERN_TYPE_INDEX).await.unwrap(), 1);
    assert_eq!(bus.zcard(keys::TIME_INDEX).await.unwrap(), 1);

    let stats = cache.stats().await;
    assert_eq!(stats.expired_cleaned, 1);
}

#[tokio::test]
async fn cleanup_sweeps_orphaned_index_entries() {
    let (bus, cache, _scan) = cache_setup();

    // Index entries whose backing record no longer exists.
    bus.zadd(keys::CONFIDENCE_INDEX, "GHOST:Doji:1900000000", 0.9)
        .await
        .unwrap();
    bus.zadd(keys::TIME_INDEX, "GHOST:Doji:1900000000", 1_900_000_000.0)
        .await
        .unwrap();
    bus.zadd(
        keys::SYMBOL_INDEX,
        "GHOST:GHOST:Doji:1900000000",
        1_900_000_000.0,
    )
    .await
    .unwrap();
    bus.zadd(
        keys::PATTERN_TYPE_INDEX,
        "Doji:GHOST:Doji:1900000000",
        1_900_000_000.0,
    )
    .await
    .unwrap();

    cache.cleanup_expired_once().await.unwrap();

    for index in [
        keys::CONFIDENCE_INDEX,
        keys::TIME_INDEX,
        keys::SYMBOL_INDEX,
        keys::PATTERN_TYPE_INDEX,
    ] {
        assert_eq!(bus.zcard(index).await.unwrap(), 0, "index {index} not swept");
    }
}

#[tokio::test]
async fn cleanup_is_a_no_op_on_live_records() {
    let (bus, cache, _scan) = cache_setup();
    let now = unix_now();
    let live = PatternEventBuilder::new("TSLA", "Doji", 0.8)
        .timestamp(now)
        .expires_at(now + 3600.0)
        .build();
    cache
        .process_event(&parse_pattern_event(&live).unwrap())
        .await
        .unwrap();

    let removed = cache.cleanup_expired_once().await.unwrap();
    assert_eq!(removed, 0);
    assert_eq!(bus.zcard(keys::CONFIDENCE_INDEX).await.unwrap(), 1);
}

#[tokio::test]
async fn clear_cache_drops_all_pattern_state() {
    let (bus, cache, scan) = cache_setup();
    let now = unix_now();
    let raw = PatternEventBuilder::new("AAPL", "Doji", 0.9)
        .timestamp(now)
        .expires_at(now + 3600.0)
        .build();
    cache
        .process_event(&parse_pattern_event(&raw).unwrap())
        .await
        .unwrap();
    scan.scan(&ScanFilters::default()).await.unwrap();

    cache.clear_cache().await.unwrap();

    assert!(bus.keys("patterns:*").await.unwrap().is_empty());
    assert!(bus.keys("api_cache:*").await.unwrap().is_empty());
    assert_eq!(bus.zcard(keys::CONFIDENCE_INDEX).await.unwrap(), 0);
}
