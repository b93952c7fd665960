//! In-memory `Bus` implementation.
//!
//! Single-process stand-in for the production bus: pub/sub over a tokio
//! broadcast channel, keyed values and hashes with lazy TTL expiry,
//! sorted sets with Redis tie-order (score, then member), append-only
//! streams, and atomic batches (one lock, so a concurrent reader never
//! observes a partial batch).
//!
//! `fail_next_ops(n)` makes the next `n` operations fail with a transient
//! error, for retry and circuit-breaker tests.

use async_trait::async_trait;
use relay_bus::{BatchOp, Bus, BusBatch, BusError, BusMessage, StreamEntry, Subscription};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Keyspace state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Expiry(Option<Instant>);

impl Expiry {
    fn from_ttl(ttl_secs: u64) -> Self {
        Expiry(Some(Instant::now() + Duration::from_secs(ttl_secs)))
    }

    fn none() -> Self {
        Expiry(None)
    }

    fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
struct State {
    kv: HashMap<String, (String, Expiry)>,
    hashes: HashMap<String, (HashMap<String, String>, Expiry)>,
    zsets: HashMap<String, HashMap<String, f64>>,
    streams: HashMap<String, (u64, VecDeque<StreamEntry>)>,
}

impl State {
    fn purge(&mut self) {
        self.kv.retain(|_, (_, exp)| !exp.is_expired());
        self.hashes.retain(|_, (_, exp)| !exp.is_expired());
    }

    fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.kv
            .keys()
            .chain(self.hashes.keys())
            .chain(self.zsets.keys())
            .chain(self.streams.keys())
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let mut removed = false;
        removed |= self.kv.remove(key).is_some();
        removed |= self.hashes.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        removed |= self.streams.remove(key).is_some();
        removed
    }

    fn apply_op(&mut self, op: &BatchOp) {
        match op {
            BatchOp::HSetEx {
                key,
                fields,
                ttl_secs,
            } => {
                let entry = self
                    .hashes
                    .entry(key.clone())
                    .or_insert_with(|| (HashMap::new(), Expiry::none()));
                for (k, v) in fields {
                    entry.0.insert(k.clone(), v.clone());
                }
                entry.1 = Expiry::from_ttl(*ttl_secs);
            }
            BatchOp::ZAdd { key, member, score } => {
                self.zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            BatchOp::ZRem { key, member } => {
                if let Some(set) = self.zsets.get_mut(key) {
                    set.remove(member);
                }
            }
            BatchOp::Expire { key, ttl_secs } => {
                let exp = Expiry::from_ttl(*ttl_secs);
                if let Some((_, e)) = self.kv.get_mut(key) {
                    *e = exp.clone();
                }
                if let Some((_, e)) = self.hashes.get_mut(key) {
                    *e = exp;
                }
                // Sorted sets and streams carry no expiry in the test double.
            }
            BatchOp::Del { key } => {
                self.remove_key(key);
            }
        }
    }
}

/// Glob matcher supporting `*` (any substring); enough for the key
/// patterns this tier uses.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match p.first() {
            None => k.is_empty(),
            Some(b'*') => {
                (0..=k.len()).any(|i| inner(&p[1..], &k[i..]))
            }
            Some(c) => k.first() == Some(c) && inner(&p[1..], &k[1..]),
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

pub struct MemoryBus {
    state: Mutex<State>,
    pubsub: broadcast::Sender<BusMessage>,
    fail_next: AtomicU32,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(1024);
        MemoryBus {
            state: Mutex::new(State::default()),
            pubsub,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next_ops(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_fail(&self) -> Result<(), BusError> {
        let prev = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            Err(BusError::Transient("injected failure".to_owned()))
        } else {
            Ok(())
        }
    }

    /// Number of live pub/sub subscriptions; lets tests wait until a
    /// subscriber loop is actually listening before publishing.
    pub fn subscriber_count(&self) -> usize {
        self.pubsub.receiver_count()
    }

    /// Number of entries currently in `stream` (test assertions).
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .expect("state lock")
            .streams
            .get(stream)
            .map_or(0, |(_, entries)| entries.len())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn ping(&self) -> Result<(), BusError> {
        self.check_fail()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        self.check_fail()?;
        // No receivers is fine; delivery is best-effort like the real bus.
        let _ = self.pubsub.send(BusMessage {
            channel: channel.to_owned(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        self.check_fail()?;
        Ok(Box::new(MemorySubscription {
            rx: Some(self.pubsub.subscribe()),
            channels: channels.to_vec(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        st.purge();
        Ok(st.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        st.kv.insert(
            key.to_owned(),
            (value.to_owned(), Expiry::from_ttl(ttl_secs)),
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        Ok(keys.iter().filter(|k| st.remove_key(k)).count() as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        st.purge();
        let mut keys: Vec<String> = st
            .all_keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        st.purge();
        Ok(st
            .hashes
            .get(key)
            .and_then(|(fields, _)| fields.get(field))
            .cloned())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BusError> {
        self.check_fail()?;
        self.state
            .lock()
            .expect("state lock")
            .zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        let Some(set) = st.zsets.get_mut(key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.remove(*m).is_some()).count() as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64, BusError> {
        self.check_fail()?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .zsets
            .get(key)
            .map_or(0, |s| s.len() as u64))
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, BusError> {
        self.check_fail()?;
        let st = self.state.lock().expect("state lock");
        let mut members: Vec<(String, f64)> = st
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    async fn zrevrangebyscore(
        &self,
        key: &str,
        max: f64,
        min: f64,
    ) -> Result<Vec<String>, BusError> {
        let mut members = self.zrangebyscore(key, min, max).await?;
        members.reverse();
        Ok(members)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        let (next, entries) = st
            .streams
            .entry(stream.to_owned())
            .or_insert_with(|| (1, VecDeque::new()));
        let id = format!("{next}-0");
        *next += 1;
        entries.push_back(StreamEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        Ok(id)
    }

    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, BusError> {
        self.check_fail()?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .streams
            .get(stream)
            .map(|(_, entries)| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn xtrim_maxlen(&self, stream: &str, maxlen: u64) -> Result<u64, BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        let Some((_, entries)) = st.streams.get_mut(stream) else {
            return Ok(0);
        };
        let mut evicted = 0;
        while entries.len() as u64 > maxlen {
            entries.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    async fn apply(&self, batch: BusBatch) -> Result<(), BusError> {
        self.check_fail()?;
        let mut st = self.state.lock().expect("state lock");
        for op in &batch.ops {
            st.apply_op(op);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySubscription
// ---------------------------------------------------------------------------

struct MemorySubscription {
    rx: Option<broadcast::Receiver<BusMessage>>,
    channels: Vec<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let rx = self.rx.as_mut().ok_or(BusError::Closed)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BusError::Closed),
                Ok(Ok(msg)) => {
                    if self.channels.iter().any(|c| c == &msg.channel) {
                        return Ok(Some(msg));
                    }
                    // Not one of ours; keep waiting within the deadline.
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.rx = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
