//! Socket fan-out: user ↔ connection registry and typed message delivery.
//!
//! Each connection is a bounded mpsc sender; the socket layer drains the
//! matching receiver into the websocket.  Delivery is best-effort per
//! connection: a full queue drops the message and advances the
//! slow-consumer counter, a closed queue unregisters the connection, and
//! neither blocks delivery to other connections.

use crate::user_filter::UserId;
use relay_protocol::SocketMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound queue high-water mark per connection.
const CONNECTION_QUEUE_DEPTH: usize = 256;

pub type ConnId = Uuid;

#[derive(Default)]
struct RegistryState {
    by_user: HashMap<UserId, HashSet<ConnId>>,
    user_by_conn: HashMap<ConnId, UserId>,
    senders: HashMap<ConnId, mpsc::Sender<SocketMessage>>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

/// Fan-out delivery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FanoutStats {
    pub delivered: u64,
    pub dropped_slow_consumer: u64,
    pub dead_connections: u64,
    pub broadcasts: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped_slow_consumer: AtomicU64,
    dead_connections: AtomicU64,
    broadcasts: AtomicU64,
}

// ---------------------------------------------------------------------------
// SocketRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SocketRegistry {
    state: RwLock<RegistryState>,
    counters: Counters,
}

impl SocketRegistry {
    pub fn new() -> Self {
        SocketRegistry::default()
    }

    /// Register a new connection for `user_id`.  Returns the connection id
    /// and the receiver the socket layer drains into the websocket.
    pub async fn register(&self, user_id: &str) -> (ConnId, mpsc::Receiver<SocketMessage>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let conn_id = Uuid::new_v4();
        let mut state = self.state.write().await;
        state
            .by_user
            .entry(user_id.to_owned())
            .or_default()
            .insert(conn_id);
        state.user_by_conn.insert(conn_id, user_id.to_owned());
        state.senders.insert(conn_id, tx);
        debug!(user_id, %conn_id, "socket connection registered");
        (conn_id, rx)
    }

    pub async fn unregister(&self, conn_id: ConnId) {
        let mut state = self.state.write().await;
        remove_connection(&mut state, conn_id);
        debug!(%conn_id, "socket connection unregistered");
    }

    pub async fn join_room(&self, conn_id: ConnId, room: &str) {
        let mut state = self.state.write().await;
        if state.senders.contains_key(&conn_id) {
            state.rooms.entry(room.to_owned()).or_default().insert(conn_id);
        }
    }

    pub async fn leave_room(&self, conn_id: ConnId, room: &str) {
        let mut state = self.state.write().await;
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(&conn_id);
        }
    }

    /// Deliver to every active connection of one user.
    ///
    /// Returns `false` iff the user has zero registered connections.
    pub async fn emit_to_user(&self, user_id: &str, message: &SocketMessage) -> bool {
        let targets: Vec<(ConnId, mpsc::Sender<SocketMessage>)> = {
            let state = self.state.read().await;
            match state.by_user.get(user_id) {
                None => return false,
                Some(conns) if conns.is_empty() => return false,
                Some(conns) => conns
                    .iter()
                    .filter_map(|id| state.senders.get(id).map(|tx| (*id, tx.clone())))
                    .collect(),
            }
        };
        if targets.is_empty() {
            return false;
        }
        self.send_all(&targets, message).await;
        true
    }

    /// Deliver to every connection of every user.
    pub async fn broadcast(&self, message: &SocketMessage) -> usize {
        let targets: Vec<(ConnId, mpsc::Sender<SocketMessage>)> = {
            let state = self.state.read().await;
            state
                .senders
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.send_all(&targets, message).await;
        targets.len()
    }

    /// Deliver to every connection in a named room.
    pub async fn emit_to_room(&self, room: &str, message: &SocketMessage) -> usize {
        let targets: Vec<(ConnId, mpsc::Sender<SocketMessage>)> = {
            let state = self.state.read().await;
            state
                .rooms
                .get(room)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| state.senders.get(id).map(|tx| (*id, tx.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };
        self.send_all(&targets, message).await;
        targets.len()
    }

    async fn send_all(&self, targets: &[(ConnId, mpsc::Sender<SocketMessage>)], message: &SocketMessage) {
        let mut dead = Vec::new();
        for (conn_id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Back-pressure: drop for this consumer only.
                    self.counters
                        .dropped_slow_consumer
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(%conn_id, topic = %message.topic, "slow consumer, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.counters.dead_connections.fetch_add(1, Ordering::Relaxed);
                    dead.push(*conn_id);
                }
            }
        }
        if !dead.is_empty() {
            let mut state = self.state.write().await;
            for conn_id in dead {
                remove_connection(&mut state, conn_id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.senders.len()
    }

    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.state
            .read()
            .await
            .by_user
            .get(user_id)
            .map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_slow_consumer: self.counters.dropped_slow_consumer.load(Ordering::Relaxed),
            dead_connections: self.counters.dead_connections.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
        }
    }
}

fn remove_connection(state: &mut RegistryState, conn_id: ConnId) {
    state.senders.remove(&conn_id);
    if let Some(user_id) = state.user_by_conn.remove(&conn_id) {
        if let Some(conns) = state.by_user.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                state.by_user.remove(&user_id);
            }
        }
    }
    for members in state.rooms.values_mut() {
        members.remove(&conn_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
