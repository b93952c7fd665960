//! End-to-end dispatch through the running service: bus publish →
//! subscriber → cache → filter → socket delivery, with offline queueing
//! and flow checkpoints.

mod common;

use common::{recv_message, start_service, unix_now, wait_until, watchlist, SharedSource};
use relay::flow::FLOW_STREAM;
use relay::scan::ScanFilters;
use relay::user_filter::FilterOutcome;
use relay_bus::Bus;
use relay_test_utils::fixtures::{self, EnvelopeShape, PatternEventBuilder};
use std::sync::Arc;
use std::time::Duration;

fn pattern_bytes(symbol: &str, confidence: f64) -> Vec<u8> {
    let now = unix_now();
    PatternEventBuilder::new(symbol, "Bull_Flag", confidence)
        .price(150.25, 2.3)
        .timestamp(now)
        .expires_at(now + 259_200.0)
        .build_bytes()
}

#[tokio::test]
async fn pattern_alert_reaches_watchlisted_user_and_scan() {
    let source = SharedSource::new(watchlist("u1", &["AAPL"]));
    let (bus, service) = start_service(Some(source)).await;
    let (_conn, mut rx) = service.connect_user("u1").await;

    bus.publish("tickstock.events.patterns", &pattern_bytes("AAPL", 0.85))
        .await
        .unwrap();

    let message = recv_message(&mut rx).await;
    assert_eq!(message.topic, "pattern_alert");
    assert_eq!(message.event["event_type"], "pattern_detected");
    assert_eq!(message.event["data"]["data"]["symbol"], "AAPL");

    let response = service
        .scan
        .scan(&ScanFilters {
            symbols: vec!["AAPL".to_owned()],
            confidence_min: 0.8,
            ..ScanFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(response.pagination.total, 1);
    assert_eq!(response.patterns[0].pattern, "BullFlag");
    assert!((response.patterns[0].conf - 0.85).abs() < f64::EPSILON);
    assert_eq!(response.patterns[0].price, "$150.25");
    assert_eq!(response.patterns[0].chg, "+2.3%");

    service.shutdown().await;
}

#[tokio::test]
async fn matched_users_get_targeted_delivery_not_broadcast() {
    let source = SharedSource::new(watchlist("u1", &["AAPL"]));
    let (bus, service) = start_service(Some(source)).await;
    let (_c1, mut rx1) = service.connect_user("u1").await;
    let (_c2, mut rx2) = service.connect_user("u2").await;

    bus.publish("tickstock.events.patterns", &pattern_bytes("AAPL", 0.85))
        .await
        .unwrap();

    let message = recv_message(&mut rx1).await;
    assert_eq!(message.topic, "pattern_alert");
    // The unmatched user sees nothing: targeted delivery never also
    // broadcasts.
    assert!(rx2.try_recv().is_err());

    service.shutdown().await;
}

#[tokio::test]
async fn broadcast_fallback_when_no_filter_is_wired() {
    let (bus, service) = start_service(None).await;
    let (_conn, mut rx) = service.connect_user("anyone").await;

    bus.publish("tickstock.events.patterns", &pattern_bytes("TSLA", 0.7))
        .await
        .unwrap();

    let message = recv_message(&mut rx).await;
    assert_eq!(message.topic, "pattern_alert");

    service.shutdown().await;
}

#[tokio::test]
async fn broadcast_fallback_when_no_user_matches() {
    let source = SharedSource::new(watchlist("u1", &["AAPL"]));
    let (bus, service) = start_service(Some(source)).await;
    let (_conn, mut rx) = service.connect_user("u1").await;

    // u1 does not watch TSLA; with zero subscribers the alert broadcasts.
    bus.publish("tickstock.events.patterns", &pattern_bytes("TSLA", 0.7))
        .await
        .unwrap();

    let message = recv_message(&mut rx).await;
    assert_eq!(message.topic, "pattern_alert");
    assert_eq!(message.event["data"]["data"]["symbol"], "TSLA");

    service.shutdown().await;
}

#[tokio::test]
async fn double_nested_flow_id_is_used_in_checkpoints() {
    let (bus, service) = start_service(None).await;
    let (_conn, mut rx) = service.connect_user("u1").await;

    let now = unix_now();
    let bytes = PatternEventBuilder::new("AAPL", "Bull_Flag", 0.85)
        .timestamp(now)
        .expires_at(now + 3600.0)
        .shape(EnvelopeShape::DoubleNested)
        .flow_id("abc")
        .build_bytes();
    bus.publish("tickstock.events.patterns", &bytes).await.unwrap();
    recv_message(&mut rx).await;

    // Checkpoint appends are fire-and-forget; wait for them to land.
    let mut landed = 0;
    for _ in 0..200 {
        let entries = bus.xrange_all(FLOW_STREAM).await.unwrap_or_default();
        landed = entries
            .iter()
            .filter(|e| e.field("flow_id") == Some("abc"))
            .count();
        if landed >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(landed >= 4, "flow checkpoints did not land");

    let entries = bus.xrange_all(FLOW_STREAM).await.unwrap();
    let checkpoints: Vec<&str> = entries
        .iter()
        .filter(|e| e.field("flow_id") == Some("abc"))
        .filter_map(|e| e.field("checkpoint"))
        .collect();
    assert!(checkpoints.contains(&"EVENT_RECEIVED"));
    assert!(checkpoints.contains(&"EVENT_PARSED"));
    assert!(checkpoints.contains(&"PATTERN_CACHED"));
    assert!(checkpoints.contains(&"WEBSOCKET_DELIVERED"));

    service.shutdown().await;
}

#[tokio::test]
async fn pattern_alert_for_offline_user_queues_and_replays_on_connect() {
    let source = SharedSource::new(watchlist("u1", &["AAPL"]));
    let (bus, service) = start_service(Some(source)).await;

    // No connection for u1 yet.
    bus.publish("tickstock.events.patterns", &pattern_bytes("AAPL", 0.85))
        .await
        .unwrap();

    let bus_probe = Arc::clone(&bus);
    wait_until("offline queue entry", move || {
        bus_probe.stream_len("offline:u1") == 1
    })
    .await;

    // Connecting drains the queue onto the new connection.
    let (_conn, mut rx) = service.connect_user("u1").await;
    let message = recv_message(&mut rx).await;
    assert_eq!(message.topic, "pattern_alert");
    assert_eq!(message.event["data"]["data"]["symbol"], "AAPL");
    assert_eq!(bus.stream_len("offline:u1"), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn backtest_progress_without_owner_broadcasts() {
    let (bus, service) = start_service(None).await;
    let (_c1, mut rx1) = service.connect_user("u1").await;
    let (_c2, mut rx2) = service.connect_user("u2").await;

    let bytes = serde_json::to_vec(&fixtures::backtest_progress("job-1", 0.4, None)).unwrap();
    bus.publish("tickstock.events.backtesting.progress", &bytes)
        .await
        .unwrap();

    assert_eq!(recv_message(&mut rx1).await.topic, "backtest_progress");
    assert_eq!(recv_message(&mut rx2).await.topic, "backtest_progress");

    let job = service.backtests.get("job-1").await.expect("job tracked");
    assert!((job.progress - 0.4).abs() < f64::EPSILON);

    service.shutdown().await;
}

#[tokio::test]
async fn backtest_result_with_owner_goes_to_owner_only() {
    let (bus, service) = start_service(None).await;
    let (_c1, mut rx1) = service.connect_user("u1").await;
    let (_c2, mut rx2) = service.connect_user("u2").await;

    let bytes =
        serde_json::to_vec(&fixtures::backtest_result("job-2", "completed", Some("u1"))).unwrap();
    bus.publish("tickstock.events.backtesting.results", &bytes)
        .await
        .unwrap();

    let message = recv_message(&mut rx1).await;
    assert_eq!(message.topic, "backtest_result");
    assert!(rx2.try_recv().is_err());

    let job = service.backtests.get("job-2").await.expect("job tracked");
    assert_eq!(job.user_id.as_deref(), Some("u1"));

    service.shutdown().await;
}

#[tokio::test]
async fn producer_health_updates_broadcast_to_everyone() {
    let (bus, service) = start_service(None).await;
    let (_c1, mut rx1) = service.connect_user("u1").await;
    let (_c2, mut rx2) = service.connect_user("u2").await;

    let bytes = serde_json::to_vec(&fixtures::system_health("healthy")).unwrap();
    bus.publish("tickstock.health.status", &bytes).await.unwrap();

    assert_eq!(recv_message(&mut rx1).await.topic, "system_health");
    assert_eq!(recv_message(&mut rx2).await.topic, "system_health");

    service.shutdown().await;
}

#[tokio::test]
async fn watchlist_update_on_dashboard_channel_refreshes_the_snapshot() {
    let source = SharedSource::new(watchlist("u1", &["AAPL"]));
    let (bus, service) = start_service(Some(source.clone())).await;

    // Wait for the initial refresh, then change the upstream watchlist.
    let filter = Arc::clone(&service.filter);
    wait_until("initial snapshot", move || filter.has_snapshot()).await;
    source.set(watchlist("u1", &["NVDA"]));

    let bytes = serde_json::to_vec(&serde_json::json!({"event_type": "watchlist_update"})).unwrap();
    bus.publish("tickstock.events.dashboard", &bytes).await.unwrap();

    let filter = Arc::clone(&service.filter);
    wait_until("refreshed snapshot", move || {
        filter.users_for("NVDA", "Doji", 0.9) == FilterOutcome::Users(vec!["u1".to_owned()])
    })
    .await;

    service.shutdown().await;
}

#[tokio::test]
async fn malformed_payloads_are_counted_and_dropped() {
    let (bus, service) = start_service(None).await;

    bus.publish("tickstock.events.patterns", b"{not json")
        .await
        .unwrap();
    // Parseable JSON but no symbol/pattern.
    bus.publish("tickstock.events.patterns", br#"{"data": {"confidence": 0.5}}"#)
        .await
        .unwrap();

    let subscriber = Arc::clone(&service.subscriber);
    wait_until("drop counters", move || {
        subscriber.stats().events_dropped >= 2
    })
    .await;
    assert_eq!(service.subscriber.stats().events_processed, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn triple_nested_payloads_advance_the_too_deep_counter() {
    let (bus, service) = start_service(None).await;

    let bytes = serde_json::to_vec(&serde_json::json!({
        "data": {"data": {"data": {"symbol": "AAPL", "pattern": "Doji"}}}
    }))
    .unwrap();
    bus.publish("tickstock.events.patterns", &bytes).await.unwrap();

    let subscriber = Arc::clone(&service.subscriber);
    wait_until("too-deep counter", move || {
        subscriber.stats().envelope_too_deep == 1
    })
    .await;

    service.shutdown().await;
}

#[tokio::test]
async fn scan_after_delivery_sees_the_new_pattern() {
    // Ordering guarantee: the cache write happens before the socket emit,
    // so a scan issued after receiving the alert must include the record.
    let (bus, service) = start_service(None).await;
    let (_conn, mut rx) = service.connect_user("u1").await;

    bus.publish("tickstock.events.patterns", &pattern_bytes("MSFT", 0.9))
        .await
        .unwrap();
    recv_message(&mut rx).await;

    let response = service
        .scan
        .scan(&ScanFilters {
            symbols: vec!["MSFT".to_owned()],
            ..ScanFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(response.pagination.total, 1);

    service.shutdown().await;
}
