//! The `Bus` trait and its operation vocabulary.

use async_trait::async_trait;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by bus operations.
///
/// `Transient` failures are retried by [`crate::BusClient`]; everything
/// else propagates to the caller immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Connection-level failure (refused, dropped, timed out).  Retryable.
    #[error("transient bus error: {0}")]
    Transient(String),
    /// The circuit breaker is open; the operation was not attempted.
    #[error("bus circuit breaker open")]
    CircuitOpen,
    /// The bus answered with something the client cannot interpret.
    #[error("bus protocol error: {0}")]
    Protocol(String),
    /// The subscription or client has been closed.
    #[error("bus connection closed")]
    Closed,
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Messages and stream entries
// ---------------------------------------------------------------------------

/// One pub/sub message as delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// One entry read back from a durable stream, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Bus-assigned entry id; opaque, ordered.
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Atomic batches
// ---------------------------------------------------------------------------

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Write hash fields and set the key TTL.
    HSetEx {
        key: String,
        fields: Vec<(String, String)>,
        ttl_secs: u64,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
    Del {
        key: String,
    },
}

/// A set of writes applied atomically: a concurrent reader observes either
/// none or all of them.
#[derive(Debug, Clone, Default)]
pub struct BusBatch {
    pub ops: Vec<BatchOp>,
}

impl BusBatch {
    pub fn new() -> Self {
        BusBatch::default()
    }

    pub fn hset_ex(
        mut self,
        key: impl Into<String>,
        fields: Vec<(String, String)>,
        ttl_secs: u64,
    ) -> Self {
        self.ops.push(BatchOp::HSetEx {
            key: key.into(),
            fields,
            ttl_secs,
        });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(BatchOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl_secs,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live subscription over a fixed channel set.
///
/// Reads are bounded so the caller's liveness actions (heartbeat, shutdown
/// check) stay responsive.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next message.  `Ok(None)` on timeout.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;

    /// Unsubscribe from all channels and close the subscription.
    async fn unsubscribe(&mut self) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Bus trait
// ---------------------------------------------------------------------------

/// The full operation set this tier needs from the message bus.
///
/// Safe for use from many concurrent callers; implementations share one
/// underlying connection pool.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn ping(&self) -> Result<(), BusError>;

    // -- pub/sub ----------------------------------------------------------
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError>;

    // -- keyed values -----------------------------------------------------
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BusError>;
    async fn del(&self, keys: &[String]) -> Result<u64, BusError>;
    /// Pattern-match key scan (glob syntax, e.g. `api_cache:*`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BusError>;

    // -- hashes -----------------------------------------------------------
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError>;

    // -- sorted sets ------------------------------------------------------
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BusError>;
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, BusError>;
    async fn zcard(&self, key: &str) -> Result<u64, BusError>;
    /// Members with `min ≤ score ≤ max`, ascending.  Infinite bounds allowed.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, BusError>;
    /// Members with `min ≤ score ≤ max`, descending.
    async fn zrevrangebyscore(&self, key: &str, max: f64, min: f64)
        -> Result<Vec<String>, BusError>;

    // -- durable streams --------------------------------------------------
    /// Append an entry; returns the bus-assigned id.
    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, BusError>;
    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, BusError>;
    /// Trim the stream to its newest `maxlen` entries; returns evicted count.
    async fn xtrim_maxlen(&self, stream: &str, maxlen: u64) -> Result<u64, BusError>;

    // -- batches ----------------------------------------------------------
    /// Apply all operations atomically.
    async fn apply(&self, batch: BusBatch) -> Result<(), BusError>;
}
