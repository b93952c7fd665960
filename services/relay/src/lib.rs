//! relay: consumer-and-broadcast tier of the market-data platform.
//!
//! Consumes detection events from the producer over the message bus,
//! maintains a queryable cache of currently-valid patterns, filters each
//! event against per-user subscriptions, and pushes alerts to connected
//! browsers over long-lived socket connections.  Backtest progress and
//! producer health are relayed as broadcasts.

pub mod backtest;
pub mod config;
pub mod fanout;
pub mod flow;
pub mod http;
pub mod offline;
pub mod pattern_cache;
pub mod scan;
pub mod service;
pub mod subscriber;
pub mod user_filter;

/// Current unix time in seconds, as carried on the wire.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
