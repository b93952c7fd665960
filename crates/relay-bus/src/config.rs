//! Bus connection configuration.

use std::time::Duration;

/// Connection settings for the production bus.  Defaults favor low
/// latency: short connect timeout, 2 s reads, 15 s health checks.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    /// Number of multiplexed connections in the pool.
    pub max_connections: usize,
    /// Per-operation response timeout.
    pub socket_timeout: Duration,
    pub socket_connect_timeout: Duration,
    /// Interval of the background ping task.
    pub health_check_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            host: "localhost".to_owned(),
            port: 6379,
            db: 0,
            password: None,
            max_connections: 20,
            socket_timeout: Duration::from_secs(2),
            socket_connect_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(15),
        }
    }
}

impl BusConfig {
    /// Connection URL (password elided from Debug/logs elsewhere).
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}
