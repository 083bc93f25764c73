//! Tunables for the client messaging stack.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the message center and its connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Number of slots in the sticky routing table. Every ordered request
    /// to the same actor flows through the same slot.
    pub client_sender_buckets: usize,
    /// Maximum connections the pool keeps per gateway endpoint.
    pub max_connections_per_endpoint: usize,
    /// Cooldown after a failed dial during which further dials to the same
    /// endpoint fail fast.
    pub connect_retry_delay: Duration,
    /// Pause between successive dial attempts of the same endpoint within
    /// one dial session.
    pub minimum_interconnect_delay: Duration,
    /// Dial attempts per endpoint before the failure is recorded.
    pub connect_retry_count: u32,
    /// How long to wait before retrying a send that lost the race with a
    /// closing connection.
    pub send_retry_delay: Duration,
    /// How long a caller waits for the per-endpoint dial guard before
    /// re-running its selection loop.
    pub attempt_guard_timeout: Duration,
    /// Upper bound on a single transport dial.
    pub connect_timeout: Duration,
    /// Polling interval while waiting for the pool to drain on close.
    pub close_poll_interval: Duration,
    /// How often to log a warning while the pool drains on close.
    pub close_warn_interval: Duration,
    /// How long `dispose` lets the connection pool drain in the
    /// background.
    pub close_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            client_sender_buckets: 8192,
            max_connections_per_endpoint: 1,
            connect_retry_delay: Duration::from_secs(1),
            minimum_interconnect_delay: Duration::from_millis(100),
            connect_retry_count: 2,
            send_retry_delay: Duration::from_secs(2),
            attempt_guard_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            close_poll_interval: Duration::from_millis(10),
            close_warn_interval: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
        }
    }
}
