#![allow(dead_code)]

use async_trait::async_trait;
use relay::config::{CacheSettings, RelayConfig};
use relay::pattern_cache::PatternCache;
use relay::scan::ScanEngine;
use relay::service::RelayService;
use relay::user_filter::{UserRules, WatchlistError, WatchlistSnapshot, WatchlistSource};
use relay_bus::BusClient;
use relay_test_utils::MemoryBus;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// A cache + scan engine over a fresh in-memory bus.
pub fn cache_setup() -> (Arc<MemoryBus>, Arc<PatternCache>, ScanEngine) {
    let bus = Arc::new(MemoryBus::new());
    let client = Arc::new(BusClient::new(bus.clone()));
    let cache = Arc::new(PatternCache::new(client, CacheSettings::default()));
    let scan = ScanEngine::new(Arc::clone(&cache));
    (bus, cache, scan)
}

/// Watchlist source backed by a shared, mutable snapshot.
pub struct SharedSource {
    pub snapshot: Mutex<WatchlistSnapshot>,
}

impl SharedSource {
    pub fn new(snapshot: WatchlistSnapshot) -> Arc<Self> {
        Arc::new(SharedSource {
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn set(&self, snapshot: WatchlistSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

#[async_trait]
impl WatchlistSource for SharedSource {
    async fn load(&self) -> Result<WatchlistSnapshot, WatchlistError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

/// Snapshot with one user watching the given symbols, no pattern rules.
pub fn watchlist(user_id: &str, symbols: &[&str]) -> WatchlistSnapshot {
    let mut snapshot = WatchlistSnapshot::new();
    snapshot.insert(
        user_id.to_owned(),
        UserRules {
            symbols: symbols.iter().map(|s| (*s).to_owned()).collect::<HashSet<_>>(),
            pattern_types: None,
            confidence_min: 0.0,
        },
    );
    snapshot
}

/// Start the full service over an in-memory bus and wait until the
/// subscriber loop is listening.
pub async fn start_service(
    source: Option<Arc<dyn WatchlistSource>>,
) -> (Arc<MemoryBus>, Arc<RelayService>) {
    let has_source = source.is_some();
    let bus = Arc::new(MemoryBus::new());
    let service = RelayService::start_with_bus(RelayConfig::default(), bus.clone(), source).await;

    for _ in 0..200 {
        // Events published before the subscriber listens (or before the
        // first watchlist load) would race the test.
        let ready = bus.subscriber_count() > 0 && (!has_source || service.filter.has_snapshot());
        if ready {
            return (bus, service);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscriber did not come up");
}

/// Wait until `probe` returns true, or panic after ~2 s.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut probe: F) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Receive the next socket message within two seconds.
pub async fn recv_message(
    rx: &mut tokio::sync::mpsc::Receiver<relay_protocol::SocketMessage>,
) -> relay_protocol::SocketMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for socket message")
        .expect("socket channel closed")
}
