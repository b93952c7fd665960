//! Offline buffering: durable per-user streams of undeliverable messages.
//!
//! Pattern alerts addressed to a user with no active connections are
//! appended to `offline:{user_id}` and drained in insertion order on the
//! user's next connect.  Each stream is capped; excess drops the oldest.
//! Market-data ticks are not durable and are never queued.

use crate::fanout::SocketRegistry;
use relay_bus::{BusClient, BusError};
use relay_protocol::SocketMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn stream_key(user_id: &str) -> String {
    format!("offline:{user_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("offline entry decode: {0}")]
    Decode(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OfflineStats {
    pub enqueued: u64,
    pub drained: u64,
    pub skipped_non_durable: u64,
}

// ---------------------------------------------------------------------------
// OfflineBuffer
// ---------------------------------------------------------------------------

pub struct OfflineBuffer {
    bus: Arc<BusClient>,
    max_per_user: u64,
    enqueued: AtomicU64,
    drained: AtomicU64,
    skipped_non_durable: AtomicU64,
}

impl OfflineBuffer {
    pub fn new(bus: Arc<BusClient>, max_per_user: u64) -> Self {
        OfflineBuffer {
            bus,
            max_per_user,
            enqueued: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            skipped_non_durable: AtomicU64::new(0),
        }
    }

    /// Queue one undeliverable message for an offline user.  Non-durable
    /// messages are dropped: there is no point replaying a stale tick.
    pub async fn enqueue(
        &self,
        user_id: &str,
        message: &SocketMessage,
        enqueued_at: f64,
    ) -> Result<(), OfflineError> {
        if !message.is_durable() {
            self.skipped_non_durable.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let key = stream_key(user_id);
        let payload = serde_json::to_string(&message.event)
            .map_err(|e| OfflineError::Decode(e.to_string()))?;
        self.bus
            .xadd(
                &key,
                &[
                    ("topic".to_owned(), message.topic.clone()),
                    ("payload".to_owned(), payload),
                    ("enqueued_at".to_owned(), enqueued_at.to_string()),
                ],
            )
            .await?;
        // Cap the queue; the oldest entries go first.
        self.bus.xtrim_maxlen(&key, self.max_per_user).await?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, topic = %message.topic, "queued offline message");
        Ok(())
    }

    /// Deliver the user's queued messages in insertion order.
    ///
    /// Fully-drained streams are deleted; if the user drops offline again
    /// mid-drain, the undelivered tail is kept.
    pub async fn drain(
        &self,
        user_id: &str,
        registry: &SocketRegistry,
    ) -> Result<u64, OfflineError> {
        let key = stream_key(user_id);
        let entries = self.bus.xrange_all(&key).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let total = entries.len() as u64;

        let mut delivered = 0u64;
        for entry in entries {
            let Some(topic) = entry.field("topic") else {
                warn!(user_id, entry = %entry.id, "offline entry missing topic, skipping");
                delivered += 1;
                continue;
            };
            let event = entry
                .field("payload")
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or(serde_json::Value::Null);
            let message = SocketMessage::new(topic, event);
            if registry.emit_to_user(user_id, &message).await {
                delivered += 1;
            } else {
                break;
            }
        }

        if delivered == total {
            self.bus.del(&[key]).await?;
        } else if delivered > 0 {
            // Trim the delivered prefix, keeping the newest tail.
            self.bus.xtrim_maxlen(&key, total - delivered).await?;
        }

        if delivered > 0 {
            self.drained.fetch_add(delivered, Ordering::Relaxed);
            info!(user_id, delivered, "drained offline queue");
        }
        Ok(delivered)
    }

    /// Number of messages currently queued for a user.
    pub async fn queued_count(&self, user_id: &str) -> Result<u64, OfflineError> {
        Ok(self.bus.xrange_all(&stream_key(user_id)).await?.len() as u64)
    }

    pub fn stats(&self) -> OfflineStats {
        OfflineStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            skipped_non_durable: self.skipped_non_durable.load(Ordering::Relaxed),
        }
    }
}
