//! Resilience wrapper around a `Bus` implementation.
//!
//! Every operation goes through one path: circuit-breaker admission,
//! bounded retries with exponential backoff for transient errors, slow
//! command logging, and statistics.  Callers see either the operation's
//! result or a `BusError` after local recovery is exhausted.

use crate::bus::{Bus, BusBatch, BusError, StreamEntry, Subscription};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(3200),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.cap)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

struct CircuitBreaker {
    state: Mutex<BreakerState>,
    reset_timeout: Duration,
}

enum Admission {
    Allowed,
    Probe,
    Rejected,
}

impl CircuitBreaker {
    fn new(reset_timeout: Duration) -> Self {
        CircuitBreaker {
            state: Mutex::new(BreakerState::default()),
            reset_timeout,
        }
    }

    fn admit(&self) -> Admission {
        let mut st = self.state.lock().expect("breaker lock");
        match st.opened_at {
            None => Admission::Allowed,
            Some(at) if at.elapsed() >= self.reset_timeout && !st.probe_in_flight => {
                st.probe_in_flight = true;
                Admission::Probe
            }
            Some(_) => Admission::Rejected,
        }
    }

    fn on_success(&self) {
        let mut st = self.state.lock().expect("breaker lock");
        if st.opened_at.is_some() {
            info!("bus circuit breaker closed after successful probe");
        }
        *st = BreakerState::default();
    }

    fn on_failure(&self) {
        let mut st = self.state.lock().expect("breaker lock");
        st.probe_in_flight = false;
        st.consecutive_failures += 1;
        if st.consecutive_failures >= BREAKER_THRESHOLD {
            if st.opened_at.is_none() {
                warn!(
                    failures = st.consecutive_failures,
                    "bus circuit breaker opened"
                );
            }
            st.opened_at = Some(Instant::now());
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().expect("breaker lock").opened_at.is_some()
    }

    fn consecutive_failures(&self) -> u32 {
        self.state
            .lock()
            .expect("breaker lock")
            .consecutive_failures
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

const SLOW_THRESHOLD: Duration = Duration::from_millis(100);
const MAX_TRACKED_TIMES: usize = 1000;

#[derive(Default)]
struct OpStats {
    total: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    slow: AtomicU64,
    // Rolling command times; single-writer sections are short.
    times_ms: Mutex<Vec<f64>>,
}

impl OpStats {
    fn record_time(&self, elapsed_ms: f64) {
        let mut times = self.times_ms.lock().expect("stats lock");
        times.push(elapsed_ms);
        if times.len() > MAX_TRACKED_TIMES {
            let keep = times.split_off(MAX_TRACKED_TIMES / 2);
            *times = keep;
        }
    }

    fn avg_ms(&self) -> f64 {
        let times = self.times_ms.lock().expect("stats lock");
        if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        }
    }
}

/// Point-in-time health view of the bus client.
#[derive(Debug, Clone, PartialEq)]
pub struct BusHealth {
    pub status: BusHealthStatus,
    pub breaker_open: bool,
    pub consecutive_failures: u32,
    pub total_ops: u64,
    pub failed_ops: u64,
    pub retried_ops: u64,
    pub rejected_ops: u64,
    pub slow_ops: u64,
    pub avg_response_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusHealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl BusHealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BusHealthStatus::Healthy => "healthy",
            BusHealthStatus::Degraded => "degraded",
            BusHealthStatus::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// BusClient
// ---------------------------------------------------------------------------

pub struct BusClient {
    inner: Arc<dyn Bus>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    stats: OpStats,
}

impl BusClient {
    pub fn new(inner: Arc<dyn Bus>) -> Self {
        Self::with_config(inner, RetryPolicy::default(), BREAKER_RESET)
    }

    /// Constructor-injection of retry and breaker timing, for tests that
    /// need deterministic recovery windows.
    pub fn with_config(inner: Arc<dyn Bus>, retry: RetryPolicy, breaker_reset: Duration) -> Self {
        BusClient {
            inner,
            breaker: CircuitBreaker::new(breaker_reset),
            retry,
            stats: OpStats::default(),
        }
    }

    /// Run one logical operation through admission, retry, and accounting.
    async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        match self.breaker.admit() {
            Admission::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(BusError::CircuitOpen);
            }
            Admission::Probe => debug!(op, "circuit breaker half-open probe"),
            Admission::Allowed => {}
        }

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut tries = 0u32;
        let result = loop {
            match attempt().await {
                Ok(v) => break Ok(v),
                Err(e) if e.is_transient() && tries < self.retry.max_retries => {
                    let backoff = self.retry.backoff(tries);
                    tries += 1;
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(op, attempt = tries, backoff_ms = backoff.as_millis() as u64,
                           error = %e, "transient bus error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.stats.record_time(elapsed_ms);
        if elapsed > SLOW_THRESHOLD {
            warn!(op, elapsed_ms, "slow bus command");
            self.stats.slow.fetch_add(1, Ordering::Relaxed);
        }

        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(op, error = %e, "bus operation failed");
                self.breaker.on_failure();
            }
        }
        result
    }

    pub fn health(&self) -> BusHealth {
        let breaker_open = self.breaker.is_open();
        let failures = self.breaker.consecutive_failures();
        let status = if breaker_open || failures >= BREAKER_THRESHOLD {
            BusHealthStatus::Error
        } else if failures >= 3 {
            BusHealthStatus::Degraded
        } else {
            BusHealthStatus::Healthy
        };
        BusHealth {
            status,
            breaker_open,
            consecutive_failures: failures,
            total_ops: self.stats.total.load(Ordering::Relaxed),
            failed_ops: self.stats.failed.load(Ordering::Relaxed),
            retried_ops: self.stats.retried.load(Ordering::Relaxed),
            rejected_ops: self.stats.rejected.load(Ordering::Relaxed),
            slow_ops: self.stats.slow.load(Ordering::Relaxed),
            avg_response_ms: self.stats.avg_ms(),
        }
    }

    /// Background ping loop; doubles as the breaker's recovery probe.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = client.ping().await {
                            debug!(error = %e, "bus health check failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Delegated operations
    // -----------------------------------------------------------------------

    pub async fn ping(&self) -> Result<(), BusError> {
        let inner = Arc::clone(&self.inner);
        self.run("ping", move || {
            let inner = Arc::clone(&inner);
            async move { inner.ping().await }
        })
        .await
    }

    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let inner = Arc::clone(&self.inner);
        let channel = channel.to_owned();
        let payload = payload.to_vec();
        self.run("publish", move || {
            let inner = Arc::clone(&inner);
            let channel = channel.clone();
            let payload = payload.clone();
            async move { inner.publish(&channel, &payload).await }
        })
        .await
    }

    pub async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        let inner = Arc::clone(&self.inner);
        let channels = channels.to_vec();
        self.run("subscribe", move || {
            let inner = Arc::clone(&inner);
            let channels = channels.clone();
            async move { inner.subscribe(&channels).await }
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.run("get", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            async move { inner.get(&key).await }
        })
        .await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        let value = value.to_owned();
        self.run("set_ex", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            let value = value.clone();
            async move { inner.set_ex(&key, &value, ttl_secs).await }
        })
        .await
    }

    pub async fn del(&self, keys: &[String]) -> Result<u64, BusError> {
        let inner = Arc::clone(&self.inner);
        let keys = keys.to_vec();
        self.run("del", move || {
            let inner = Arc::clone(&inner);
            let keys = keys.clone();
            async move { inner.del(&keys).await }
        })
        .await
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let inner = Arc::clone(&self.inner);
        let pattern = pattern.to_owned();
        self.run("keys", move || {
            let inner = Arc::clone(&inner);
            let pattern = pattern.clone();
            async move { inner.keys(&pattern).await }
        })
        .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        let field = field.to_owned();
        self.run("hget", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            let field = field.clone();
            async move { inner.hget(&key, &field).await }
        })
        .await
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        let member = member.to_owned();
        self.run("zadd", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            let member = member.clone();
            async move { inner.zadd(&key, &member, score).await }
        })
        .await
    }

    pub async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        let members = members.to_vec();
        self.run("zrem", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            let members = members.clone();
            async move { inner.zrem(&key, &members).await }
        })
        .await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.run("zcard", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            async move { inner.zcard(&key).await }
        })
        .await
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.run("zrangebyscore", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            async move { inner.zrangebyscore(&key, min, max).await }
        })
        .await
    }

    pub async fn zrevrangebyscore(
        &self,
        key: &str,
        max: f64,
        min: f64,
    ) -> Result<Vec<String>, BusError> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.run("zrevrangebyscore", move || {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            async move { inner.zrevrangebyscore(&key, max, min).await }
        })
        .await
    }

    pub async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, BusError> {
        let inner = Arc::clone(&self.inner);
        let stream = stream.to_owned();
        let fields = fields.to_vec();
        self.run("xadd", move || {
            let inner = Arc::clone(&inner);
            let stream = stream.clone();
            let fields = fields.clone();
            async move { inner.xadd(&stream, &fields).await }
        })
        .await
    }

    pub async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, BusError> {
        let inner = Arc::clone(&self.inner);
        let stream = stream.to_owned();
        self.run("xrange_all", move || {
            let inner = Arc::clone(&inner);
            let stream = stream.clone();
            async move { inner.xrange_all(&stream).await }
        })
        .await
    }

    pub async fn xtrim_maxlen(&self, stream: &str, maxlen: u64) -> Result<u64, BusError> {
        let inner = Arc::clone(&self.inner);
        let stream = stream.to_owned();
        self.run("xtrim_maxlen", move || {
            let inner = Arc::clone(&inner);
            let stream = stream.clone();
            async move { inner.xtrim_maxlen(&stream, maxlen).await }
        })
        .await
    }

    pub async fn apply(&self, batch: BusBatch) -> Result<(), BusError> {
        let inner = Arc::clone(&self.inner);
        self.run("apply", move || {
            let inner = Arc::clone(&inner);
            let batch = batch.clone();
            async move { inner.apply(batch).await }
        })
        .await
    }
}
