//! Pattern cache: per-pattern records, secondary indexes, and the
//! query-response cache, all held in the bus keyspace.
//!
//! # Keys
//! - `patterns:{id}`: hash with fields `data` (record JSON) and
//!   `cached_at`; TTL = pattern TTL.
//! - `indexes:confidence` / `indexes:time`: sorted sets of `id` scored by
//!   confidence / detection time.
//! - `indexes:symbol` / `indexes:pattern_type`: sorted sets of
//!   `{symbol}:{id}` / `{pattern_type}:{id}` scored by detection time.
//! - `api_cache:scan:{md5}`: cached scan responses; short TTL.
//!
//! Writes are applied as one atomic batch so concurrent scans never see a
//! record without its index entries.  Records expire by their own
//! `expires_at` (checked on read and swept every minute) with the bus TTL
//! as a backstop.

use crate::config::CacheSettings;
use crate::unix_now;
use relay_bus::{BusBatch, BusClient, BusError};
use relay_protocol::{PatternAction, PatternEvent, PatternRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

pub mod keys {
    pub const PATTERN_PREFIX: &str = "patterns:";
    pub const CONFIDENCE_INDEX: &str = "indexes:confidence";
    pub const TIME_INDEX: &str = "indexes:time";
    pub const SYMBOL_INDEX: &str = "indexes:symbol";
    pub const PATTERN_TYPE_INDEX: &str = "indexes:pattern_type";
    pub const API_CACHE_PREFIX: &str = "api_cache:";

    pub fn pattern(id: &str) -> String {
        format!("{PATTERN_PREFIX}{id}")
    }

    pub fn scan_response(filter_hash: &str) -> String {
        format!("{API_CACHE_PREFIX}scan:{filter_hash}")
    }
}

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_ERROR_SLEEP: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("record serialization: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheCounters {
    events_processed: AtomicU64,
    write_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    expired_cleaned: AtomicU64,
    last_event_time: Mutex<Option<f64>>,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub cached_patterns: u64,
    pub events_processed: u64,
    pub write_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f64,
    pub expired_cleaned: u64,
    pub api_response_cache_size: u64,
    pub index_cache_size: u64,
    pub last_event_time: Option<f64>,
}

// ---------------------------------------------------------------------------
// PatternCache
// ---------------------------------------------------------------------------

pub struct PatternCache {
    bus: Arc<BusClient>,
    settings: CacheSettings,
    counters: CacheCounters,
}

impl PatternCache {
    pub fn new(bus: Arc<BusClient>, settings: CacheSettings) -> Self {
        info!(
            pattern_ttl = settings.pattern_ttl_secs,
            api_ttl = settings.api_response_ttl_secs,
            "pattern cache ready"
        );
        PatternCache {
            bus,
            settings,
            counters: CacheCounters::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Apply one pattern event to the cache.
    ///
    /// Detected and Updated both write the full record (an update is an
    /// overwrite); Expired removes the record and its index entries.
    /// Write failures are counted and the event is dropped — the producer
    /// emits a continuous stream, and a stale retry is worse than a miss.
    pub async fn process_event(&self, evt: &PatternEvent) -> Result<(), CacheError> {
        let result = match evt.action {
            PatternAction::Detected | PatternAction::Updated => self.cache_pattern(evt).await,
            PatternAction::Expired => self.remove_pattern(evt).await,
        };

        match &result {
            Ok(()) => {
                self.counters.events_processed.fetch_add(1, Ordering::Relaxed);
                *self.counters.last_event_time.lock().expect("stats lock") = Some(unix_now());
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(symbol = %evt.payload.symbol, pattern = %evt.payload.pattern,
                       error = %e, "cache write failed, event dropped");
            }
        }
        result
    }

    /// Build the stored record from an event, resolving detection and
    /// expiry instants.
    pub fn record_from_event(&self, evt: &PatternEvent) -> PatternRecord {
        let now = unix_now();
        let detected_at = evt.payload.timestamp.or(evt.timestamp).unwrap_or(now);
        let expires_at = evt
            .payload
            .expires_at
            .unwrap_or(now + self.settings.pattern_ttl_secs as f64);
        PatternRecord {
            symbol: evt.payload.symbol.clone(),
            pattern_type: evt.payload.pattern.clone(),
            confidence: evt.payload.confidence,
            current_price: evt.payload.current_price,
            price_change: evt.payload.price_change,
            detected_at,
            expires_at,
            indicators: evt.payload.indicators.clone(),
            source_tier: evt.payload.source,
        }
    }

    async fn cache_pattern(&self, evt: &PatternEvent) -> Result<(), CacheError> {
        let record = self.record_from_event(evt);
        let id = record.id();
        let data =
            serde_json::to_string(&record).map_err(|e| CacheError::Serialize(e.to_string()))?;

        let ttl = self.settings.pattern_ttl_secs;
        let index_ttl = self.settings.index_ttl_secs;
        let batch = BusBatch::new()
            .hset_ex(
                keys::pattern(&id),
                vec![
                    ("data".to_owned(), data),
                    ("cached_at".to_owned(), unix_now().to_string()),
                ],
                ttl,
            )
            .zadd(keys::CONFIDENCE_INDEX, id.clone(), record.confidence)
            .zadd(
                keys::SYMBOL_INDEX,
                format!("{}:{}", record.symbol, id),
                record.detected_at,
            )
            .zadd(
                keys::PATTERN_TYPE_INDEX,
                format!("{}:{}", record.pattern_type, id),
                record.detected_at,
            )
            .zadd(keys::TIME_INDEX, id.clone(), record.detected_at)
            .expire(keys::CONFIDENCE_INDEX, index_ttl)
            .expire(keys::SYMBOL_INDEX, index_ttl)
            .expire(keys::PATTERN_TYPE_INDEX, index_ttl)
            .expire(keys::TIME_INDEX, index_ttl);

        self.bus.apply(batch).await?;
        self.invalidate_response_cache().await;

        debug!(
            symbol = %record.symbol,
            pattern = %record.pattern_type,
            confidence = record.confidence,
            "cached pattern"
        );
        Ok(())
    }

    async fn remove_pattern(&self, evt: &PatternEvent) -> Result<(), CacheError> {
        let record = self.record_from_event(evt);
        let id = record.id();
        self.bus
            .apply(removal_batch(&id, &record.symbol, &record.pattern_type))
            .await?;
        self.invalidate_response_cache().await;
        debug!(id = %id, "removed expired pattern");
        Ok(())
    }

    /// Delete every cached scan response.  Best-effort: failures are
    /// logged, and the short response TTL bounds any staleness.
    pub async fn invalidate_response_cache(&self) {
        match self
            .bus
            .keys(&format!("{}*", keys::API_CACHE_PREFIX))
            .await
        {
            Ok(cache_keys) if !cache_keys.is_empty() => {
                let count = cache_keys.len();
                if let Err(e) = self.bus.del(&cache_keys).await {
                    warn!(error = %e, "response cache invalidation failed");
                } else {
                    debug!(entries = count, "invalidated response cache");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "response cache key scan failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Read path (used by the scan engine)
    // -----------------------------------------------------------------------

    /// Load one record by id; `None` when the record vanished (expired
    /// between index read and load) or fails to parse.
    pub async fn load_record(&self, id: &str) -> Result<Option<PatternRecord>, CacheError> {
        let Some(data) = self.bus.hget(&keys::pattern(id), "data").await? else {
            return Ok(None);
        };
        match serde_json::from_str::<PatternRecord>(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(id, error = %e, "invalid record data, skipping");
                Ok(None)
            }
        }
    }

    /// Candidate ids above the confidence floor, ordered by the
    /// confidence index.
    pub async fn confidence_candidates(
        &self,
        confidence_min: f64,
        descending: bool,
    ) -> Result<Vec<String>, CacheError> {
        let ids = if descending {
            self.bus
                .zrevrangebyscore(keys::CONFIDENCE_INDEX, f64::INFINITY, confidence_min)
                .await?
        } else {
            self.bus
                .zrangebyscore(keys::CONFIDENCE_INDEX, confidence_min, f64::INFINITY)
                .await?
        };
        Ok(ids)
    }

    /// Fetch a cached scan response; counts the hit or miss.
    pub async fn response_cache_get(&self, key: &str) -> Option<String> {
        match self.bus.get(key).await {
            Ok(Some(body)) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(body)
            }
            Ok(None) => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "response cache read failed");
                None
            }
        }
    }

    /// Store a scan response under its filter-hash key.  Best-effort.
    pub async fn response_cache_put(&self, key: &str, body: &str) {
        if let Err(e) = self
            .bus
            .set_ex(key, body, self.settings.api_response_ttl_secs)
            .await
        {
            warn!(error = %e, "response cache write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Expiration
    // -----------------------------------------------------------------------

    /// One cleanup pass: remove records past their `expires_at` together
    /// with their index entries, then drop orphaned index members whose
    /// record no longer exists.  Returns the number of records removed.
    pub async fn cleanup_expired_once(&self) -> Result<u64, CacheError> {
        let now = unix_now();
        let pattern_keys = self
            .bus
            .keys(&format!("{}*", keys::PATTERN_PREFIX))
            .await?;

        let mut live_ids = Vec::with_capacity(pattern_keys.len());
        let mut batch = BusBatch::new();
        let mut removed = 0u64;

        for key in &pattern_keys {
            let id = &key[keys::PATTERN_PREFIX.len()..];
            match self.load_record(id).await? {
                Some(record) if record.expires_at <= now => {
                    for op in removal_batch(id, &record.symbol, &record.pattern_type).ops {
                        batch.ops.push(op);
                    }
                    removed += 1;
                }
                Some(_) => live_ids.push(id.to_owned()),
                None => {}
            }
        }

        // Orphaned index entries: ids in the confidence index without a
        // backing record.
        let indexed = self
            .bus
            .zrangebyscore(keys::CONFIDENCE_INDEX, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        for id in indexed {
            if live_ids.iter().any(|l| *l == id) {
                continue;
            }
            if pattern_keys.iter().any(|k| k[keys::PATTERN_PREFIX.len()..] == *id) {
                continue;
            }
            // id is `symbol:pattern_type:ts`; recover the index members.
            let mut parts = id.splitn(3, ':');
            let symbol = parts.next().unwrap_or_default().to_owned();
            let pattern_type = parts.next().unwrap_or_default().to_owned();
            for op in removal_batch(&id, &symbol, &pattern_type).ops {
                batch.ops.push(op);
            }
        }

        if !batch.is_empty() {
            self.bus.apply(batch).await?;
        }
        if removed > 0 {
            self.counters
                .expired_cleaned
                .fetch_add(removed, Ordering::Relaxed);
            self.invalidate_response_cache().await;
            debug!(removed, "cleaned up expired patterns");
        }
        Ok(removed)
    }

    /// Background cleanup loop, every 60 s; shorter sleep after an error.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!("cache cleanup task started");
            loop {
                let sleep = match cache.cleanup_expired_once().await {
                    Ok(_) => CLEANUP_INTERVAL,
                    Err(e) => {
                        error!(error = %e, "cache cleanup pass failed");
                        CLEANUP_ERROR_SLEEP
                    }
                };
                tokio::select! {
                    () = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("cache cleanup task stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance and statistics
    // -----------------------------------------------------------------------

    /// Drop all pattern state: records, indexes, cached responses.
    pub async fn clear_cache(&self) -> Result<u64, CacheError> {
        let mut all = self
            .bus
            .keys(&format!("{}*", keys::PATTERN_PREFIX))
            .await?;
        all.extend(
            self.bus
                .keys(&format!("{}*", keys::API_CACHE_PREFIX))
                .await?,
        );
        all.extend([
            keys::CONFIDENCE_INDEX.to_owned(),
            keys::TIME_INDEX.to_owned(),
            keys::SYMBOL_INDEX.to_owned(),
            keys::PATTERN_TYPE_INDEX.to_owned(),
        ]);
        let removed = self.bus.del(&all).await?;
        info!(removed, "cleared pattern cache");
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let cached_patterns = self
            .bus
            .keys(&format!("{}*", keys::PATTERN_PREFIX))
            .await
            .map_or(0, |k| k.len() as u64);
        let api_response_cache_size = self
            .bus
            .keys(&format!("{}*", keys::API_CACHE_PREFIX))
            .await
            .map_or(0, |k| k.len() as u64);
        let mut index_cache_size = 0;
        for index in [
            keys::CONFIDENCE_INDEX,
            keys::SYMBOL_INDEX,
            keys::PATTERN_TYPE_INDEX,
            keys::TIME_INDEX,
        ] {
            index_cache_size += self.bus.zcard(index).await.unwrap_or(0);
        }

        let hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let hit_ratio = if hits + misses == 0 {
            1.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStats {
            cached_patterns,
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            hit_ratio,
            expired_cleaned: self.counters.expired_cleaned.load(Ordering::Relaxed),
            api_response_cache_size,
            index_cache_size,
            last_event_time: *self.counters.last_event_time.lock().expect("stats lock"),
        }
    }

    /// The cache is healthy when its backing keyspace answers.
    pub async fn healthy(&self) -> bool {
        self.bus.zcard(keys::CONFIDENCE_INDEX).await.is_ok()
    }
}

/// The batch that removes one record and all of its index entries.
fn removal_batch(id: &str, symbol: &str, pattern_type: &str) -> BusBatch {
    BusBatch::new()
        .del(keys::pattern(id))
        .zrem(keys::CONFIDENCE_INDEX, id)
        .zrem(keys::SYMBOL_INDEX, format!("{symbol}:{id}"))
        .zrem(keys::PATTERN_TYPE_INDEX, format!("{pattern_type}:{id}"))
        .zrem(keys::TIME_INDEX, id)
}
