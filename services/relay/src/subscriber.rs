//! Event subscriber: consumes producer events from the bus and fans them
//! out.
//!
//! One logical loop reads with a bounded timeout so heartbeat and
//! shutdown stay responsive, classifies each message by channel, parses
//! the envelope, and dispatches through an exhaustive match:
//!
//! - pattern events: flow checkpoints, cache write (strictly before any
//!   delivery), watchlist filtering, per-user emit with offline queueing,
//!   broadcast fallback when no user filter applies;
//! - backtest events: job registry update, emit to the owning user or
//!   broadcast;
//! - producer health: broadcast to every connection.
//!
//! Malformed payloads and unknown channels are counted and dropped, never
//! retried.

use crate::backtest::BacktestRegistry;
use crate::config::Channels;
use crate::fanout::SocketRegistry;
use crate::flow::{Checkpoint, FlowLogger};
use crate::offline::OfflineBuffer;
use crate::pattern_cache::PatternCache;
use crate::service::HealthStatus;
use crate::unix_now;
use crate::user_filter::{FilterOutcome, WatchlistFilter};
use relay_bus::{BusClient, BusMessage};
use relay_protocol::{
    parse_pattern_event, topics, BusEvent, EnvelopeError, EventKind, EventPayload, PatternEvent,
    SocketMessage,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_SLEEP: Duration = Duration::from_secs(1);
const PRODUCER_HEARTBEAT_KEY: &str = "producer:heartbeat";
const PRODUCER_OFFLINE_AFTER: f64 = 60.0;
const EVENT_SILENCE_WARNING: f64 = 300.0;
const HEARTBEAT_STREAM: &str = "subscriber:heartbeats";

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_forwarded: AtomicU64,
    events_dropped: AtomicU64,
    envelope_too_deep: AtomicU64,
    connection_errors: AtomicU64,
    last_event_time: Mutex<Option<f64>>,
    last_heartbeat: Mutex<Option<f64>>,
}

/// Subscriber statistics snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SubscriberStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub envelope_too_deep: u64,
    pub connection_errors: u64,
    pub runtime_seconds: f64,
    pub events_per_second: f64,
    pub is_running: bool,
    pub subscribed_channels: Vec<String>,
    pub last_event_time: Option<f64>,
    pub last_heartbeat: Option<f64>,
}

/// Subscriber health report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SubscriberHealth {
    pub status: HealthStatus,
    pub message: String,
    pub producer_online: bool,
    pub stats: SubscriberStats,
}

// ---------------------------------------------------------------------------
// EventSubscriber
// ---------------------------------------------------------------------------

pub struct EventSubscriber {
    bus: Arc<BusClient>,
    cache: Arc<PatternCache>,
    filter: Arc<WatchlistFilter>,
    registry: Arc<SocketRegistry>,
    offline: Arc<OfflineBuffer>,
    flows: Arc<FlowLogger>,
    backtests: Arc<BacktestRegistry>,
    channels: Channels,
    heartbeat_interval: Duration,
    counters: Counters,
    running: AtomicBool,
    started: Instant,
}

impl EventSubscriber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<BusClient>,
        cache: Arc<PatternCache>,
        filter: Arc<WatchlistFilter>,
        registry: Arc<SocketRegistry>,
        offline: Arc<OfflineBuffer>,
        flows: Arc<FlowLogger>,
        backtests: Arc<BacktestRegistry>,
        channels: Channels,
        heartbeat_interval: Duration,
    ) -> Self {
        EventSubscriber {
            bus,
            cache,
            filter,
            registry,
            offline,
            flows,
            backtests,
            channels,
            heartbeat_interval,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    fn kind_for_channel(&self, channel: &str) -> Option<EventKind> {
        if channel == self.channels.patterns {
            Some(EventKind::PatternDetected)
        } else if channel == self.channels.backtest_progress {
            Some(EventKind::BacktestProgress)
        } else if channel == self.channels.backtest_results {
            Some(EventKind::BacktestResult)
        } else if channel == self.channels.health {
            Some(EventKind::SystemHealth)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run the subscription loop until the shutdown signal fires.
    pub fn spawn(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let sub = Arc::clone(self);
        tokio::spawn(async move {
            sub.running.store(true, Ordering::SeqCst);
            info!("subscriber loop starting");
            let channel_names = sub.channels.all();
            let mut last_heartbeat = Instant::now();

            'outer: while !*shutdown.borrow() {
                let mut subscription = match sub.bus.subscribe(&channel_names).await {
                    Ok(s) => {
                        info!(channels = ?channel_names, "subscribed to producer channels");
                        s
                    }
                    Err(e) => {
                        sub.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "subscribe failed, retrying");
                        tokio::select! {
                            () = tokio::time::sleep(ERROR_SLEEP) => continue 'outer,
                            _ = shutdown.changed() => break 'outer,
                        }
                    }
                };

                loop {
                    if last_heartbeat.elapsed() >= sub.heartbeat_interval {
                        sub.emit_heartbeat().await;
                        last_heartbeat = Instant::now();
                    }

                    let next = tokio::select! {
                        next = subscription.next_message(READ_TIMEOUT) => next,
                        _ = shutdown.changed() => {
                            let _ = subscription.unsubscribe().await;
                            break 'outer;
                        }
                    };

                    match next {
                        Ok(None) => {}
                        Ok(Some(msg)) => sub.process_message(msg).await,
                        Err(e) => {
                            sub.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "subscription read failed, resubscribing");
                            let _ = subscription.unsubscribe().await;
                            tokio::time::sleep(ERROR_SLEEP).await;
                            break;
                        }
                    }
                }
            }

            sub.running.store(false, Ordering::SeqCst);
            info!("subscriber loop stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Message processing
    // -----------------------------------------------------------------------

    async fn process_message(&self, msg: BusMessage) {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        let raw: serde_json::Value = match std::str::from_utf8(&msg.payload)
            .ok()
            .and_then(|text| serde_json::from_str(text).ok())
        {
            Some(v) => v,
            None => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %msg.channel, "malformed message payload, dropped");
                return;
            }
        };

        // The dashboard side-channel only carries watchlist invalidations.
        if msg.channel == self.channels.dashboard {
            if raw.get("event_type").and_then(|v| v.as_str()) == Some(topics::WATCHLIST_UPDATE) {
                self.filter.invalidate().await;
                self.counters.events_processed.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let Some(kind) = self.kind_for_channel(&msg.channel) else {
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %msg.channel, "message on unknown channel, dropped");
            return;
        };

        let payload = match self.parse_payload(kind, &raw) {
            Ok(p) => p,
            Err(e) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                if e == EnvelopeError::TooDeep {
                    self.counters.envelope_too_deep.fetch_add(1, Ordering::Relaxed);
                }
                warn!(channel = %msg.channel, error = %e, "unparseable event, dropped");
                return;
            }
        };

        let event = BusEvent {
            kind,
            channel: msg.channel.clone(),
            source: raw
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_owned(),
            timestamp: raw
                .get("timestamp")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or_else(unix_now),
            raw,
            payload,
        };

        self.dispatch(event).await;
        self.counters.events_processed.fetch_add(1, Ordering::Relaxed);
        *self.counters.last_event_time.lock().expect("stats lock") = Some(unix_now());
    }

    fn parse_payload(
        &self,
        kind: EventKind,
        raw: &serde_json::Value,
    ) -> Result<EventPayload, EnvelopeError> {
        match kind {
            EventKind::PatternDetected => Ok(EventPayload::Pattern(parse_pattern_event(raw)?)),
            EventKind::BacktestProgress => {
                let data = raw.get("data").unwrap_or(raw);
                serde_json::from_value(data.clone())
                    .map(EventPayload::BacktestProgress)
                    .map_err(|_| EnvelopeError::BadField("job_id"))
            }
            EventKind::BacktestResult => {
                let data = raw.get("data").unwrap_or(raw);
                serde_json::from_value(data.clone())
                    .map(EventPayload::BacktestResult)
                    .map_err(|_| EnvelopeError::BadField("job_id"))
            }
            EventKind::SystemHealth => Ok(EventPayload::SystemHealth(
                raw.get("data").cloned().unwrap_or(serde_json::Value::Null),
            )),
        }
    }

    async fn dispatch(&self, event: BusEvent) {
        match &event.payload {
            EventPayload::Pattern(pattern) => {
                self.handle_pattern(&event, pattern).await;
            }
            EventPayload::BacktestProgress(progress) => {
                let job = self.backtests.update_progress(progress).await;
                let message =
                    SocketMessage::new(topics::BACKTEST_PROGRESS, event.to_socket_value());
                self.emit_to_owner_or_broadcast(job.user_id.as_deref(), &message).await;
            }
            EventPayload::BacktestResult(result) => {
                let job = self.backtests.complete(result).await;
                let message = SocketMessage::new(topics::BACKTEST_RESULT, event.to_socket_value());
                self.emit_to_owner_or_broadcast(job.user_id.as_deref(), &message).await;
                info!(job_id = %job.job_id, status = ?job.status, "backtest result forwarded");
            }
            EventPayload::SystemHealth(_) => {
                let message = SocketMessage::new(topics::SYSTEM_HEALTH, event.to_socket_value());
                self.registry.broadcast(&message).await;
                self.counters.events_forwarded.fetch_add(1, Ordering::Relaxed);
                debug!("producer health update broadcast");
            }
        }
    }

    async fn emit_to_owner_or_broadcast(&self, owner: Option<&str>, message: &SocketMessage) {
        let delivered = match owner {
            Some(user_id) => self.registry.emit_to_user(user_id, message).await,
            None => false,
        };
        if !delivered {
            self.registry.broadcast(message).await;
        }
        self.counters.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_pattern(&self, event: &BusEvent, pattern: &PatternEvent) {
        let flow_id = self.flows.begin(pattern.flow_id.clone());
        self.flows
            .checkpoint(&flow_id, Checkpoint::EventReceived, &event.channel);
        self.flows.checkpoint(
            &flow_id,
            Checkpoint::EventParsed,
            &format!("{}@{}", pattern.payload.pattern, pattern.payload.symbol),
        );

        // Cache write completes before any delivery so a scan issued after
        // the alert always sees the pattern.
        let record = self.cache.record_from_event(pattern);
        if self.cache.process_event(pattern).await.is_ok() {
            self.flows
                .checkpoint(&flow_id, Checkpoint::PatternCached, &record.id());
        }

        let outcome = self.filter.users_for(
            &pattern.payload.symbol,
            &pattern.payload.pattern,
            pattern.payload.confidence,
        );
        let audience = match &outcome {
            FilterOutcome::Users(users) => format!("{} users", users.len()),
            FilterOutcome::Unavailable => "filter unavailable".to_owned(),
        };
        self.flows
            .checkpoint(&flow_id, Checkpoint::UserFiltered, &audience);

        let message = SocketMessage::new(topics::PATTERN_ALERT, event.to_socket_value());
        let delivered_detail = match outcome {
            FilterOutcome::Users(users) if !users.is_empty() => {
                let mut delivered = 0usize;
                let mut queued = 0usize;
                for user_id in &users {
                    if self.registry.emit_to_user(user_id, &message).await {
                        delivered += 1;
                    } else if let Err(e) =
                        self.offline.enqueue(user_id, &message, unix_now()).await
                    {
                        warn!(user_id = %user_id, error = %e, "offline enqueue failed");
                    } else {
                        queued += 1;
                    }
                }
                self.counters
                    .events_forwarded
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                format!("delivered={delivered} queued={queued}")
            }
            // No matched users or no usable filter: explicit broadcast
            // fallback, never both paths.
            _ => {
                let connections = self.registry.broadcast(&message).await;
                self.counters.events_forwarded.fetch_add(1, Ordering::Relaxed);
                format!("broadcast={connections}")
            }
        };
        self.flows
            .checkpoint(&flow_id, Checkpoint::WebsocketDelivered, &delivered_detail);
    }

    // -----------------------------------------------------------------------
    // Heartbeat and producer liveness
    // -----------------------------------------------------------------------

    async fn emit_heartbeat(&self) {
        let stats = self.stats();
        info!(
            channels = stats.subscribed_channels.len(),
            events_received = stats.events_received,
            events_processed = stats.events_processed,
            uptime_secs = stats.runtime_seconds as u64,
            "subscriber heartbeat: alive and listening"
        );
        let fields = vec![
            ("channels".to_owned(), stats.subscribed_channels.join(",")),
            (
                "events_received".to_owned(),
                stats.events_received.to_string(),
            ),
            (
                "events_processed".to_owned(),
                stats.events_processed.to_string(),
            ),
            (
                "events_forwarded".to_owned(),
                stats.events_forwarded.to_string(),
            ),
            (
                "connection_errors".to_owned(),
                stats.connection_errors.to_string(),
            ),
            (
                "uptime_seconds".to_owned(),
                format!("{:.0}", stats.runtime_seconds),
            ),
        ];
        if let Err(e) = self.bus.xadd(HEARTBEAT_STREAM, &fields).await {
            debug!(error = %e, "heartbeat record append failed");
        }
        *self.counters.last_heartbeat.lock().expect("stats lock") = Some(unix_now());
    }

    /// The producer is online when its heartbeat key is fresher than 60 s;
    /// recent pattern keys count as a fallback liveness signal.
    pub async fn producer_online(&self) -> bool {
        match self.bus.get(PRODUCER_HEARTBEAT_KEY).await {
            Ok(Some(value)) => {
                if let Ok(heartbeat_time) = value.parse::<f64>() {
                    return unix_now() - heartbeat_time < PRODUCER_OFFLINE_AFTER;
                }
                false
            }
            Ok(None) => self
                .bus
                .keys("patterns:*")
                .await
                .map(|keys| !keys.is_empty())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------------
    // Statistics and health
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriberStats {
        let runtime = self.started.elapsed().as_secs_f64();
        let received = self.counters.events_received.load(Ordering::Relaxed);
        SubscriberStats {
            events_received: received,
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            events_forwarded: self.counters.events_forwarded.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            envelope_too_deep: self.counters.envelope_too_deep.load(Ordering::Relaxed),
            connection_errors: self.counters.connection_errors.load(Ordering::Relaxed),
            runtime_seconds: runtime,
            events_per_second: received as f64 / runtime.max(1.0),
            is_running: self.is_running(),
            subscribed_channels: self.channels.all(),
            last_event_time: *self.counters.last_event_time.lock().expect("stats lock"),
            last_heartbeat: *self.counters.last_heartbeat.lock().expect("stats lock"),
        }
    }

    pub async fn health(&self) -> SubscriberHealth {
        let stats = self.stats();
        let producer_online = self.producer_online().await;

        let (status, message) = if !stats.is_running {
            (
                HealthStatus::Error,
                "subscriber loop not running".to_owned(),
            )
        } else if stats.connection_errors > 5 {
            (
                HealthStatus::Degraded,
                format!("multiple connection errors ({})", stats.connection_errors),
            )
        } else if !producer_online {
            (
                HealthStatus::Warning,
                "producer appears offline".to_owned(),
            )
        } else if stats
            .last_event_time
            .is_some_and(|t| unix_now() - t > EVENT_SILENCE_WARNING)
        {
            (
                HealthStatus::Warning,
                "no events received in last 5 minutes".to_owned(),
            )
        } else {
            (HealthStatus::Healthy, "operating normally".to_owned())
        };

        SubscriberHealth {
            status,
            message,
            producer_online,
            stats,
        }
    }

}
