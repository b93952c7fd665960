//! Watchlist-based user filtering for pattern alerts.
//!
//! The reference store (symbol lists, per-user watchlists) is an external
//! collaborator behind the [`WatchlistSource`] trait.  The filter keeps a
//! copy-on-refresh snapshot: readers clone the current `Arc` and never
//! contend with the refresh task.
//!
//! When the snapshot is empty, never loaded, or no source is wired, the
//! filter fails open ([`FilterOutcome::Unavailable`]) and the subscriber
//! takes the broadcast fallback path.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type UserId = String;

/// Per-user alert rules.  Absent pattern rules reduce the filter to
/// symbol membership above the user's confidence floor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRules {
    pub symbols: HashSet<String>,
    /// `None` means any pattern type.
    pub pattern_types: Option<HashSet<String>>,
    pub confidence_min: f64,
}

pub type WatchlistSnapshot = HashMap<UserId, UserRules>;

#[derive(Debug, thiserror::Error)]
pub enum WatchlistError {
    #[error("watchlist source unavailable: {0}")]
    Unavailable(String),
}

/// Narrow interface to the reference store.
#[async_trait]
pub trait WatchlistSource: Send + Sync {
    async fn load(&self) -> Result<WatchlistSnapshot, WatchlistError>;
}

/// Result of resolving the audience for one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Users whose rules match; may be empty.
    Users(Vec<UserId>),
    /// No usable snapshot; the caller should broadcast instead.
    Unavailable,
}

// ---------------------------------------------------------------------------
// WatchlistFilter
// ---------------------------------------------------------------------------

pub struct WatchlistFilter {
    source: Option<Arc<dyn WatchlistSource>>,
    snapshot: RwLock<Option<Arc<WatchlistSnapshot>>>,
    refresh_failures: AtomicU64,
    refreshes: AtomicU64,
}

impl WatchlistFilter {
    pub fn new(source: Option<Arc<dyn WatchlistSource>>) -> Self {
        WatchlistFilter {
            source,
            snapshot: RwLock::new(None),
            refresh_failures: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Reload the snapshot from the source.  A failed load keeps the
    /// previous snapshot; stale rules beat a broadcast storm.
    pub async fn refresh(&self) -> bool {
        let Some(source) = &self.source else {
            return false;
        };
        match source.load().await {
            Ok(snapshot) => {
                let users = snapshot.len();
                *self.snapshot.write().expect("snapshot lock") = Some(Arc::new(snapshot));
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(users, "watchlist snapshot refreshed");
                true
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "watchlist refresh failed, keeping previous snapshot");
                false
            }
        }
    }

    /// Resolve the set of users whose watchlist admits this pattern.
    pub fn users_for(&self, symbol: &str, pattern_type: &str, confidence: f64) -> FilterOutcome {
        let snapshot = {
            let guard = self.snapshot.read().expect("snapshot lock");
            guard.clone()
        };
        let Some(snapshot) = snapshot else {
            return FilterOutcome::Unavailable;
        };
        if snapshot.is_empty() {
            return FilterOutcome::Unavailable;
        }

        let mut users: Vec<UserId> = snapshot
            .iter()
            .filter(|(_, rules)| {
                rules.symbols.contains(symbol)
                    && rules
                        .pattern_types
                        .as_ref()
                        .is_none_or(|types| types.contains(pattern_type))
                    && confidence >= rules.confidence_min
            })
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        FilterOutcome::Users(users)
    }

    /// Eager refresh, triggered by `watchlist_update` dashboard events.
    pub async fn invalidate(&self) {
        debug!("watchlist invalidated, refreshing eagerly");
        self.refresh().await;
    }

    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.read().expect("snapshot lock").is_some()
    }

    /// Periodic refresh loop.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let filter = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "watchlist refresh task started");
            filter.refresh().await;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        filter.refresh().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
