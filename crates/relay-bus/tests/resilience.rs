//! Retry and circuit-breaker behavior of `BusClient`, driven by a
//! scripted bus that fails on demand.

use async_trait::async_trait;
use relay_bus::{
    Bus, BusBatch, BusClient, BusError, BusHealthStatus, BusMessage, RetryPolicy, StreamEntry,
    Subscription,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A bus whose next outcomes are scripted; unscripted calls succeed.
#[derive(Default)]
struct ScriptedBus {
    outcomes: Mutex<VecDeque<Result<(), BusError>>>,
    calls: AtomicU64,
}

impl ScriptedBus {
    fn push_failures(&self, n: usize) {
        let mut q = self.outcomes.lock().unwrap();
        for _ in 0..n {
            q.push_back(Err(BusError::Transient("scripted failure".to_owned())));
        }
    }

    fn push(&self, outcome: Result<(), BusError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn step(&self) -> Result<(), BusError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bus for ScriptedBus {
    async fn ping(&self) -> Result<(), BusError> {
        self.step()
    }
    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<(), BusError> {
        self.step()
    }
    async fn subscribe(&self, _channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        self.step()?;
        Ok(Box::new(EmptySubscription))
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, BusError> {
        self.step().map(|()| None)
    }
    async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), BusError> {
        self.step()
    }
    async fn del(&self, _keys: &[String]) -> Result<u64, BusError> {
        self.step().map(|()| 0)
    }
    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, BusError> {
        self.step().map(|()| vec![])
    }
    async fn hget(&self, _key: &str, _field: &str) -> Result<Option<String>, BusError> {
        self.step().map(|()| None)
    }
    async fn zadd(&self, _key: &str, _member: &str, _score: f64) -> Result<(), BusError> {
        self.step()
    }
    async fn zrem(&self, _key: &str, _members: &[String]) -> Result<u64, BusError> {
        self.step().map(|()| 0)
    }
    async fn zcard(&self, _key: &str) -> Result<u64, BusError> {
        self.step().map(|()| 0)
    }
    async fn zrangebyscore(
        &self,
        _key: &str,
        _min: f64,
        _max: f64,
    ) -> Result<Vec<String>, BusError> {
        self.step().map(|()| vec![])
    }
    async fn zrevrangebyscore(
        &self,
        _key: &str,
        _max: f64,
        _min: f64,
    ) -> Result<Vec<String>, BusError> {
        self.step().map(|()| vec![])
    }
    async fn xadd(&self, _stream: &str, _fields: &[(String, String)]) -> Result<String, BusError> {
        self.step().map(|()| "0-1".to_owned())
    }
    async fn xrange_all(&self, _stream: &str) -> Result<Vec<StreamEntry>, BusError> {
        self.step().map(|()| vec![])
    }
    async fn xtrim_maxlen(&self, _stream: &str, _maxlen: u64) -> Result<u64, BusError> {
        self.step().map(|()| 0)
    }
    async fn apply(&self, _batch: BusBatch) -> Result<(), BusError> {
        self.step()
    }
}

struct EmptySubscription;

#[async_trait]
impl Subscription for EmptySubscription {
    async fn next_message(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        Ok(None)
    }
    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(4),
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(2);
    let client = BusClient::with_config(bus.clone(), fast_retry(), Duration::from_secs(30));

    client.ping().await.expect("third attempt succeeds");
    assert_eq!(bus.calls(), 3);

    let health = client.health();
    assert_eq!(health.status, BusHealthStatus::Healthy);
    assert_eq!(health.retried_ops, 2);
    assert_eq!(health.failed_ops, 0);
}

#[tokio::test]
async fn transient_failures_surface_after_three_retries() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(4);
    let client = BusClient::with_config(bus.clone(), fast_retry(), Duration::from_secs(30));

    let err = client.ping().await.expect_err("retries exhausted");
    assert!(matches!(err, BusError::Transient(_)));
    // 1 initial attempt + 3 retries.
    assert_eq!(bus.calls(), 4);
    assert_eq!(client.health().failed_ops, 1);
}

#[tokio::test]
async fn protocol_errors_are_not_retried() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push(Err(BusError::Protocol("bad reply".to_owned())));
    let client = BusClient::with_config(bus.clone(), fast_retry(), Duration::from_secs(30));

    let err = client.get("k").await.expect_err("protocol error surfaces");
    assert!(matches!(err, BusError::Protocol(_)));
    assert_eq!(bus.calls(), 1);
    assert_eq!(client.health().retried_ops, 0);
}

#[tokio::test]
async fn breaker_opens_after_five_consecutive_failures_and_rejects() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(5);
    let client = BusClient::with_config(bus.clone(), no_retry(), Duration::from_secs(30));

    for _ in 0..5 {
        let _ = client.ping().await;
    }
    let health = client.health();
    assert!(health.breaker_open);
    assert_eq!(health.status, BusHealthStatus::Error);

    // Rejected without touching the underlying bus.
    let calls_before = bus.calls();
    let err = client.ping().await.expect_err("breaker rejects");
    assert!(matches!(err, BusError::CircuitOpen));
    assert_eq!(bus.calls(), calls_before);
    assert_eq!(client.health().rejected_ops, 1);
}

#[tokio::test]
async fn breaker_half_open_probe_closes_on_success() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(5);
    let client = BusClient::with_config(bus.clone(), no_retry(), Duration::from_millis(50));

    for _ in 0..5 {
        let _ = client.ping().await;
    }
    assert!(client.health().breaker_open);

    // Wait out the reset window; the next op is the half-open probe and
    // succeeds (script exhausted), closing the breaker.
    tokio::time::sleep(Duration::from_millis(80)).await;
    client.ping().await.expect("probe succeeds");

    let health = client.health();
    assert!(!health.breaker_open);
    assert_eq!(health.status, BusHealthStatus::Healthy);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn failed_probe_reopens_the_breaker() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(6);
    let client = BusClient::with_config(bus.clone(), no_retry(), Duration::from_millis(50));

    for _ in 0..5 {
        let _ = client.ping().await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Probe consumes the sixth scripted failure and reopens.
    let _ = client.ping().await.expect_err("probe fails");
    let err = client.ping().await.expect_err("still open");
    assert!(matches!(err, BusError::CircuitOpen));
}

#[tokio::test]
async fn degraded_after_three_consecutive_failures() {
    let bus = Arc::new(ScriptedBus::default());
    bus.push_failures(3);
    let client = BusClient::with_config(bus.clone(), no_retry(), Duration::from_secs(30));

    for _ in 0..3 {
        let _ = client.ping().await;
    }
    assert_eq!(client.health().status, BusHealthStatus::Degraded);
    assert!(!client.health().breaker_open);

    // A success clears the streak.
    client.ping().await.unwrap();
    assert_eq!(client.health().status, BusHealthStatus::Healthy);
}
