//! Offline buffering: durable messages queue for disconnected users and
//! drain in insertion order on the next connect, capped per user.

mod common;

use common::unix_now;
use relay::fanout::SocketRegistry;
use relay::offline::OfflineBuffer;
use relay_bus::BusClient;
use relay_protocol::{topics, SocketMessage};
use relay_test_utils::MemoryBus;
use serde_json::json;
use std::sync::Arc;

fn setup() -> (Arc<MemoryBus>, OfflineBuffer, SocketRegistry) {
    setup_with_cap(1000)
}

fn setup_with_cap(cap: u64) -> (Arc<MemoryBus>, OfflineBuffer, SocketRegistry) {
    let bus = Arc::new(MemoryBus::new());
    let client = Arc::new(BusClient::new(bus.clone()));
    (bus, OfflineBuffer::new(client, cap), SocketRegistry::new())
}

fn alert(n: u32) -> SocketMessage {
    SocketMessage::new(topics::PATTERN_ALERT, json!({"seq": n}))
}

#[tokio::test]
async fn queued_messages_drain_in_insertion_order() {
    let (_bus, offline, registry) = setup();

    for n in 0..3 {
        offline.enqueue("u1", &alert(n), unix_now()).await.unwrap();
    }
    assert_eq!(offline.queued_count("u1").await.unwrap(), 3);

    let (_conn, mut rx) = registry.register("u1").await;
    let delivered = offline.drain("u1", &registry).await.unwrap();
    assert_eq!(delivered, 3);

    for n in 0..3 {
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, topics::PATTERN_ALERT);
        assert_eq!(msg.event["seq"], n);
    }

    // Fully-drained stream is deleted.
    assert_eq!(offline.queued_count("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn queue_is_capped_and_drops_the_oldest() {
    let (_bus, offline, registry) = setup_with_cap(5);

    for n in 0..8 {
        offline.enqueue("u1", &alert(n), unix_now()).await.unwrap();
    }
    assert_eq!(offline.queued_count("u1").await.unwrap(), 5);

    let (_conn, mut rx) = registry.register("u1").await;
    offline.drain("u1", &registry).await.unwrap();

    // Oldest three (0, 1, 2) were dropped at enqueue time.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.event["seq"], 3);
}

#[tokio::test]
async fn non_durable_messages_are_not_queued() {
    let (_bus, offline, _registry) = setup();

    let tick = SocketMessage::new(topics::DASHBOARD_PRICE_UPDATE, json!({"price": 1.0}));
    offline.enqueue("u1", &tick, unix_now()).await.unwrap();

    assert_eq!(offline.queued_count("u1").await.unwrap(), 0);
    assert_eq!(offline.stats().skipped_non_durable, 1);
    assert_eq!(offline.stats().enqueued, 0);
}

#[tokio::test]
async fn drain_for_user_with_empty_queue_is_a_no_op() {
    let (_bus, offline, registry) = setup();
    let (_conn, _rx) = registry.register("u1").await;
    assert_eq!(offline.drain("u1", &registry).await.unwrap(), 0);
}

#[tokio::test]
async fn interrupted_drain_keeps_the_undelivered_tail() {
    let (_bus, offline, registry) = setup();

    for n in 0..3 {
        offline.enqueue("u1", &alert(n), unix_now()).await.unwrap();
    }

    // The connection dies immediately: the first emit prunes it, the
    // second finds no connections and stops the drain.
    let (_conn, rx) = registry.register("u1").await;
    drop(rx);
    let delivered = offline.drain("u1", &registry).await.unwrap();

    assert!(delivered < 3);
    let remaining = offline.queued_count("u1").await.unwrap();
    assert_eq!(remaining, 3 - delivered);
}

#[tokio::test]
async fn drained_messages_count_in_stats() {
    let (_bus, offline, registry) = setup();
    for n in 0..2 {
        offline.enqueue("u1", &alert(n), unix_now()).await.unwrap();
    }
    let (_conn, mut rx) = registry.register("u1").await;
    offline.drain("u1", &registry).await.unwrap();

    assert_eq!(offline.stats().enqueued, 2);
    assert_eq!(offline.stats().drained, 2);
    assert!(rx.recv().await.is_some());
}
