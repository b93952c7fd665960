//! Production `Bus` implementation over Redis.
//!
//! Holds a small pool of multiplexed connections (the async equivalent of
//! the classic blocking connection pool) handed out round-robin.  Each
//! manager reconnects on its own; operation-level retry, backoff, and the
//! circuit breaker live in [`crate::BusClient`].

use crate::bus::{BatchOp, Bus, BusBatch, BusError, BusMessage, StreamEntry, Subscription};
use crate::config::BusConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_err(e: &redis::RedisError) -> BusError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped() {
        BusError::Transient(e.to_string())
    } else {
        BusError::Protocol(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// RedisBus
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    conns: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl RedisBus {
    /// Open the connection pool and verify it with a ping.
    pub async fn connect(cfg: &BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(cfg.url()).map_err(|e| map_err(&e))?;

        let mgr_cfg = ConnectionManagerConfig::new()
            .set_connection_timeout(cfg.socket_connect_timeout)
            .set_response_timeout(cfg.socket_timeout);

        let pool_size = cfg.max_connections.max(1);
        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = client
                .get_connection_manager_with_config(mgr_cfg.clone())
                .await
                .map_err(|e| map_err(&e))?;
            conns.push(conn);
        }

        let bus = RedisBus {
            client,
            conns,
            next: AtomicUsize::new(0),
        };
        bus.ping().await?;
        info!(
            host = %cfg.host,
            port = cfg.port,
            pool = pool_size,
            "bus connection pool ready"
        );
        Ok(bus)
    }

    fn conn(&self) -> ConnectionManager {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[i].clone()
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_err(&e))?;
        for channel in channels {
            pubsub.subscribe(channel).await.map_err(|e| map_err(&e))?;
        }
        Ok(Box::new(RedisSubscription {
            pubsub: Some(pubsub),
            channels: channels.to_vec(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(|e| map_err(&e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BusError> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, BusError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        conn.del(keys).await.map_err(|e| map_err(&e))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn();
        conn.keys(pattern).await.map_err(|e| map_err(&e))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(|e| map_err(&e))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BusError> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, BusError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        conn.zrem(key, members).await.map_err(|e| map_err(&e))
    }

    async fn zcard(&self, key: &str) -> Result<u64, BusError> {
        let mut conn = self.conn();
        conn.zcard(key).await.map_err(|e| map_err(&e))
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn();
        conn.zrangebyscore(key, min, max)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn zrevrangebyscore(
        &self,
        key: &str,
        max: f64,
        min: f64,
    ) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn();
        conn.zrevrangebyscore(key, max, min)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, BusError> {
        let mut conn = self.conn();
        conn.xadd(stream, "*", fields)
            .await
            .map_err(|e| map_err(&e))
    }

    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn.xrange_all(stream).await.map_err(|e| map_err(&e))?;
        let mut entries = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            let mut fields = Vec::with_capacity(id.map.len());
            for (k, v) in id.map {
                let value: String = redis::from_redis_value(&v)
                    .map_err(|e| BusError::Protocol(format!("stream field {}: {}", k, e)))?;
                fields.push((k, value));
            }
            // Field order inside one entry is not guaranteed by the reply
            // map; keep it deterministic.
            fields.sort();
            entries.push(StreamEntry { id: id.id, fields });
        }
        Ok(entries)
    }

    async fn xtrim_maxlen(&self, stream: &str, maxlen: u64) -> Result<u64, BusError> {
        let mut conn = self.conn();
        let maxlen = usize::try_from(maxlen).unwrap_or(usize::MAX);
        conn.xtrim(stream, StreamMaxlen::Equals(maxlen))
            .await
            .map_err(|e| map_err(&e))
    }

    async fn apply(&self, batch: BusBatch) -> Result<(), BusError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &batch.ops {
            match op {
                BatchOp::HSetEx {
                    key,
                    fields,
                    ttl_secs,
                } => {
                    pipe.hset_multiple(key, fields).ignore();
                    pipe.expire(key, *ttl_secs as i64).ignore();
                }
                BatchOp::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                BatchOp::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                BatchOp::Expire { key, ttl_secs } => {
                    pipe.expire(key, *ttl_secs as i64).ignore();
                }
                BatchOp::Del { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let mut conn = self.conn();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_err(&e))
    }
}

// ---------------------------------------------------------------------------
// RedisSubscription
// ---------------------------------------------------------------------------

struct RedisSubscription {
    pubsub: Option<redis::aio::PubSub>,
    channels: Vec<String>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let pubsub = self.pubsub.as_mut().ok_or(BusError::Closed)?;
        let mut stream = pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BusError::Transient("pubsub stream ended".to_owned())),
            Ok(Some(msg)) => {
                let payload: Vec<u8> = msg
                    .get_payload()
                    .map_err(|e| BusError::Protocol(e.to_string()))?;
                Ok(Some(BusMessage {
                    channel: msg.get_channel_name().to_owned(),
                    payload,
                }))
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        if let Some(mut pubsub) = self.pubsub.take() {
            for channel in &self.channels {
                pubsub
                    .unsubscribe(channel)
                    .await
                    .map_err(|e| map_err(&e))?;
            }
        }
        Ok(())
    }
}
