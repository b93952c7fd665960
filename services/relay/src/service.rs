//! Service orchestration: wires the bus client, cache, filter, fan-out,
//! offline buffer, flow logger, and subscriber; runs the background
//! tasks; aggregates health; shuts down in reverse dependency order.

use crate::backtest::BacktestRegistry;
use crate::config::RelayConfig;
use crate::fanout::{ConnId, SocketRegistry};
use crate::flow::FlowLogger;
use crate::offline::OfflineBuffer;
use crate::pattern_cache::{CacheStats, PatternCache};
use crate::scan::ScanEngine;
use crate::subscriber::{EventSubscriber, SubscriberHealth};
use crate::user_filter::{WatchlistFilter, WatchlistSource};
use relay_bus::{Bus, BusClient, BusError, BusHealthStatus, RedisBus};
use relay_protocol::SocketMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Component and roll-up health states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Error => "error",
        }
    }
}

fn from_bus_status(status: BusHealthStatus) -> HealthStatus {
    match status {
        BusHealthStatus::Healthy => HealthStatus::Healthy,
        BusHealthStatus::Degraded => HealthStatus::Degraded,
        BusHealthStatus::Error => HealthStatus::Error,
    }
}

/// Per-component status plus the roll-up.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RelayHealth {
    pub status: HealthStatus,
    pub healthy: bool,
    pub producer_online: bool,
    pub components: ComponentHealth,
    pub cache: CacheStats,
    pub subscriber: SubscriberHealth,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentHealth {
    pub bus: HealthStatus,
    pub pattern_cache: HealthStatus,
    pub event_subscriber: HealthStatus,
}

// ---------------------------------------------------------------------------
// Startup errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("bus unreachable at startup: {0}")]
    Bus(#[from] BusError),
}

// ---------------------------------------------------------------------------
// RelayService
// ---------------------------------------------------------------------------

pub struct RelayService {
    pub config: RelayConfig,
    pub bus: Arc<BusClient>,
    pub cache: Arc<PatternCache>,
    pub scan: Arc<ScanEngine>,
    pub filter: Arc<WatchlistFilter>,
    pub registry: Arc<SocketRegistry>,
    pub offline: Arc<OfflineBuffer>,
    pub flows: Arc<FlowLogger>,
    pub backtests: Arc<BacktestRegistry>,
    pub subscriber: Arc<EventSubscriber>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl RelayService {
    /// Connect to the production bus and start every component.
    pub async fn start(
        config: RelayConfig,
        watchlist_source: Option<Arc<dyn WatchlistSource>>,
    ) -> Result<Arc<Self>, StartError> {
        let redis = RedisBus::connect(&config.bus).await?;
        Ok(Self::start_with_bus(config, Arc::new(redis), watchlist_source).await)
    }

    /// Start over an already-connected bus implementation.  Tests inject
    /// the in-memory bus here.
    pub async fn start_with_bus(
        config: RelayConfig,
        raw_bus: Arc<dyn Bus>,
        watchlist_source: Option<Arc<dyn WatchlistSource>>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Startup order: bus client, cache, filter, fan-out, offline
        // buffer, flow logger, subscriber, then the periodic tasks.
        let bus = Arc::new(BusClient::new(raw_bus));
        let cache = Arc::new(PatternCache::new(Arc::clone(&bus), config.cache.clone()));
        let scan = Arc::new(ScanEngine::new(Arc::clone(&cache)));
        let filter = Arc::new(WatchlistFilter::new(watchlist_source));
        let registry = Arc::new(SocketRegistry::new());
        let offline = Arc::new(OfflineBuffer::new(
            Arc::clone(&bus),
            config.max_offline_per_user,
        ));
        let flows = Arc::new(FlowLogger::new(Arc::clone(&bus)));
        let backtests = Arc::new(BacktestRegistry::new());
        let subscriber = Arc::new(EventSubscriber::new(
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&filter),
            Arc::clone(&registry),
            Arc::clone(&offline),
            Arc::clone(&flows),
            Arc::clone(&backtests),
            config.channels.clone(),
            config.heartbeat_interval,
        ));

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push((
            "bus-health",
            bus.spawn_health_check(config.bus.health_check_interval, shutdown_rx.clone()),
        ));
        tasks.push((
            "watchlist-refresh",
            filter.spawn_refresh_task(config.watchlist_refresh, shutdown_rx.clone()),
        ));
        tasks.push(("subscriber", subscriber.spawn(shutdown_rx.clone())));
        tasks.push(("cache-cleanup", cache.spawn_cleanup_task(shutdown_rx)));

        info!("relay service started");
        Arc::new(RelayService {
            config,
            bus,
            cache,
            scan,
            filter,
            registry,
            offline,
            flows,
            backtests,
            subscriber,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    // -----------------------------------------------------------------------
    // Socket lifecycle (used by the edge)
    // -----------------------------------------------------------------------

    /// Register a connection for `user_id` and drain their offline queue.
    pub async fn connect_user(
        &self,
        user_id: &str,
    ) -> (ConnId, mpsc::Receiver<SocketMessage>) {
        let (conn_id, rx) = self.registry.register(user_id).await;
        if let Err(e) = self.offline.drain(user_id, &self.registry).await {
            warn!(user_id, error = %e, "offline drain failed");
        }
        (conn_id, rx)
    }

    pub async fn disconnect_user(&self, conn_id: ConnId) {
        self.registry.unregister(conn_id).await;
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Aggregate health: healthy iff the bus and cache are healthy,
    /// warning when the subscriber is down or the producer is offline,
    /// degraded when error counters pass their thresholds.
    pub async fn health(&self) -> RelayHealth {
        let bus_status = from_bus_status(self.bus.health().status);
        let cache_ok = self.cache.healthy().await;
        let cache_status = if cache_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Error
        };
        let subscriber = self.subscriber.health().await;

        let status = if bus_status == HealthStatus::Error || !cache_ok {
            HealthStatus::Error
        } else if bus_status == HealthStatus::Degraded
            || subscriber.status == HealthStatus::Degraded
        {
            HealthStatus::Degraded
        } else if !subscriber.stats.is_running || subscriber.status == HealthStatus::Warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        RelayHealth {
            status,
            healthy: status == HealthStatus::Healthy,
            producer_online: subscriber.producer_online,
            components: ComponentHealth {
                bus: bus_status,
                pattern_cache: cache_status,
                event_subscriber: subscriber.status,
            },
            cache: self.cache.stats().await,
            connections: self.registry.connection_count().await,
            subscriber,
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Signal every task and join them in reverse startup order; each
    /// join is bounded and component errors are ignored.
    pub async fn shutdown(&self) {
        info!("relay service stopping");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        while let Some((name, handle)) = tasks.pop() {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended with error"),
                Err(_) => {
                    error!(task = name, "task did not stop within 5s, abandoning");
                }
            }
        }
        info!("relay service stopped");
    }
}
