//! Message-bus client: the single seam between this tier and the bus.
//!
//! [`Bus`] is the narrow operation set every component talks through
//! (publish/subscribe, keyed reads and writes with TTL, sorted-set
//! indexes, durable append-only streams, atomic batches, ping).
//! [`RedisBus`] is the production implementation; tests substitute an
//! in-memory implementation.
//!
//! [`BusClient`] wraps any `Bus` with the resilience layer: bounded
//! retries with exponential backoff, a circuit breaker (5 consecutive
//! failures opens it for 30 s, then a half-open probe), slow-command
//! logging, and operation statistics.

mod bus;
mod client;
mod config;
mod redis_bus;

pub use bus::{BatchOp, Bus, BusBatch, BusError, BusMessage, StreamEntry, Subscription};
pub use client::{BusClient, BusHealth, BusHealthStatus, RetryPolicy};
pub use config::BusConfig;
pub use redis_bus::RedisBus;
