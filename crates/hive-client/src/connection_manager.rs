//! The per-endpoint connection pool.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hive_proto::GatewayEndpoint;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::MessagingConfig;
use crate::connection::{GatewayConnection, InboundSink};
use crate::error::ClientError;
use crate::status::GatewayCountObserver;
use crate::transport::{GatewayConnector, MessageSink, MessageStream, TransportError};

/// Pool state for one endpoint.
struct EndpointEntry {
    /// Open connections, oldest first. Bounded by
    /// `max_connections_per_endpoint`.
    connections: Vec<Arc<GatewayConnection>>,
    /// Serializes dial attempts for this endpoint.
    dial_guard: Arc<Semaphore>,
    /// When the last dial failed; drives the fast-fail cooldown.
    last_failure: Option<Instant>,
}

impl EndpointEntry {
    fn new() -> Self {
        Self {
            connections: Vec::new(),
            dial_guard: Arc::new(Semaphore::new(1)),
            last_failure: None,
        }
    }
}

struct PoolInner {
    config: MessagingConfig,
    connector: Arc<dyn GatewayConnector>,
    inbound: Arc<dyn InboundSink>,
    observer: Arc<GatewayCountObserver>,
    entries: RwLock<HashMap<GatewayEndpoint, EndpointEntry>>,
    /// Round-robin cursor across an endpoint's connections. With the
    /// default capacity of one this never matters, but it keeps selection
    /// fair if the capacity is raised.
    cursor: AtomicUsize,
    closing: AtomicBool,
}

/// Pool of gateway connections keyed by endpoint.
///
/// Guarantees at most `max_connections_per_endpoint` connections and at
/// most one in-flight dial per endpoint, fails fast while an endpoint is
/// inside its post-failure cooldown, and drives every established
/// connection with a background reader task that removes it from the pool
/// when its transport ends.
///
/// Cheap to clone; clones share one underlying pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
}

impl ConnectionManager {
    /// Create a pool dialing through `connector`.
    ///
    /// Inbound messages from every connection are pushed into `inbound`;
    /// open/close transitions are reported to `observer`.
    #[must_use]
    pub fn new(
        config: MessagingConfig,
        connector: Arc<dyn GatewayConnector>,
        inbound: Arc<dyn InboundSink>,
        observer: Arc<GatewayCountObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                inbound,
                observer,
                entries: RwLock::new(HashMap::new()),
                cursor: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Number of open connections across all endpoints. Best-effort
    /// snapshot.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner
            .entries
            .read()
            .values()
            .map(|e| e.connections.len())
            .sum()
    }

    /// Endpoints that currently hold at least one connection.
    #[must_use]
    pub fn connected_endpoints(&self) -> HashSet<GatewayEndpoint> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.connections.is_empty())
            .map(|(endpoint, _)| *endpoint)
            .collect()
    }

    /// Fast path: a pooled connection for `endpoint` if the entry is at
    /// capacity and the round-robin pick is still valid.
    #[must_use]
    pub fn try_get(&self, endpoint: &GatewayEndpoint) -> Option<Arc<GatewayConnection>> {
        let entries = self.inner.entries.read();
        let entry = entries.get(endpoint)?;
        self.pick_valid(entry)
    }

    fn pick_valid(&self, entry: &EndpointEntry) -> Option<Arc<GatewayConnection>> {
        let valid: Vec<&Arc<GatewayConnection>> = entry
            .connections
            .iter()
            .filter(|c| c.is_valid())
            .collect();
        if valid.is_empty() || valid.len() < self.inner.config.max_connections_per_endpoint {
            return None;
        }
        let cursor = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(valid[cursor % valid.len()]))
    }

    /// Get a live connection to `endpoint`, dialing one if needed.
    ///
    /// Idempotent under concurrency: any number of concurrent callers for
    /// the same endpoint produce at most one dial attempt.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionFailed`] if the dial fails or the endpoint
    /// is inside its failure cooldown; [`ClientError::ConnectionAborted`]
    /// if the pool is shutting down.
    pub async fn get_connection(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<Arc<GatewayConnection>, ClientError> {
        loop {
            if self.inner.closing.load(Ordering::SeqCst) {
                return Err(self.aborted(endpoint));
            }
            if let Some(conn) = self.try_get(endpoint) {
                return Ok(conn);
            }

            // Install the entry (first caller wins, losers observe it) and
            // take its dial guard, honoring the cooldown.
            let guard = {
                let mut entries = self.inner.entries.write();
                let entry = entries.entry(*endpoint).or_insert_with(EndpointEntry::new);
                if let Some(conn) = self.pick_valid(entry) {
                    return Ok(conn);
                }
                if let Some(err) = self.cooldown_error(endpoint, entry) {
                    return Err(err);
                }
                Arc::clone(&entry.dial_guard)
            };

            let permit = match tokio::time::timeout(
                self.inner.config.attempt_guard_timeout,
                guard.acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                // Guard held by another dialer (timeout) or its entry was
                // torn down (closed semaphore): re-run the selection loop
                // and observe that dialer's outcome.
                Ok(Err(_)) | Err(_) => continue,
            };

            // Another dialer may have just finished.
            if let Some(conn) = self.try_get(endpoint) {
                return Ok(conn);
            }
            {
                let entries = self.inner.entries.read();
                if let Some(entry) = entries.get(endpoint) {
                    if let Some(err) = self.cooldown_error(endpoint, entry) {
                        return Err(err);
                    }
                }
            }

            match self.dial(endpoint).await {
                Ok((sink, stream)) => {
                    let conn = Arc::new(GatewayConnection::new(*endpoint));
                    self.register(&conn, sink, stream);
                    drop(permit);
                    if self.inner.closing.load(Ordering::SeqCst) {
                        conn.close("connection manager shutting down");
                        return Err(self.aborted(endpoint));
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    {
                        let mut entries = self.inner.entries.write();
                        let entry =
                            entries.entry(*endpoint).or_insert_with(EndpointEntry::new);
                        entry.last_failure = Some(Instant::now());
                    }
                    drop(permit);
                    return Err(ClientError::ConnectionFailed {
                        endpoint: *endpoint,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn cooldown_error(
        &self,
        endpoint: &GatewayEndpoint,
        entry: &EndpointEntry,
    ) -> Option<ClientError> {
        let last_failure = entry.last_failure?;
        if last_failure.elapsed() < self.inner.config.connect_retry_delay {
            Some(ClientError::ConnectionFailed {
                endpoint: *endpoint,
                reason: "in cooldown after recent dial failure".to_string(),
            })
        } else {
            None
        }
    }

    fn aborted(&self, endpoint: &GatewayEndpoint) -> ClientError {
        ClientError::ConnectionAborted {
            endpoint: *endpoint,
            reason: "connection manager is closed".to_string(),
        }
    }

    /// Dial with the configured per-endpoint retry schedule.
    async fn dial(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<(MessageSink, MessageStream), TransportError> {
        let attempts = self.inner.config.connect_retry_count.max(1);
        let mut last_error = TransportError::Timeout;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.inner.config.minimum_interconnect_delay).await;
            }
            if self.inner.closing.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            match tokio::time::timeout(
                self.inner.config.connect_timeout,
                self.inner.connector.connect(endpoint),
            )
            .await
            {
                Ok(Ok(transport)) => return Ok(transport),
                Ok(Err(e)) => {
                    warn!(gateway = %endpoint, attempt, error = %e, "dial attempt failed");
                    last_error = e;
                }
                Err(_) => {
                    warn!(gateway = %endpoint, attempt, "dial attempt timed out");
                    last_error = TransportError::Timeout;
                }
            }
        }
        Err(last_error)
    }

    /// Add the connection to the pool and spawn its reader task.
    fn register(
        &self,
        connection: &Arc<GatewayConnection>,
        sink: MessageSink,
        stream: MessageStream,
    ) {
        {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .entry(*connection.endpoint())
                .or_insert_with(EndpointEntry::new);
            // Connections already invalidated are on their way out through
            // their reader tasks; they no longer count against capacity.
            entry.connections.retain(|c| c.is_valid());
            entry.connections.push(Arc::clone(connection));
            entry.last_failure = None;
        }
        self.inner.observer.connection_opened();

        let manager = self.clone();
        let connection = Arc::clone(connection);
        let inbound = Arc::clone(&self.inner.inbound);
        tokio::spawn(async move {
            let reason = connection.run(sink, stream, inbound.as_ref()).await;
            manager.finish(&connection, &reason);
        });
    }

    /// Teardown after a connection's transport ends. Removal and the
    /// closed notification each run exactly once per connection.
    fn finish(&self, connection: &Arc<GatewayConnection>, reason: &str) {
        self.remove(connection.endpoint(), connection);
        if connection.latch_closed() {
            self.inner.observer.connection_closed();
            info!(gateway = %connection.endpoint(), reason, "gateway connection closed");
        }
    }

    /// Remove one connection instance from the pool.
    ///
    /// Removing a connection that is already gone is a no-op. The entry
    /// itself is dropped once it holds no connections and no cooldown
    /// state, keeping [`ConnectionManager::connected_endpoints`] accurate.
    pub fn remove(&self, endpoint: &GatewayEndpoint, connection: &Arc<GatewayConnection>) {
        let mut entries = self.inner.entries.write();
        if let Some(entry) = entries.get_mut(endpoint) {
            entry.connections.retain(|c| !Arc::ptr_eq(c, connection));
            if entry.connections.is_empty() && entry.last_failure.is_none() {
                entries.remove(endpoint);
            }
        }
    }

    /// Drop the endpoint's entry and close every one of its connections.
    pub fn abort(&self, endpoint: &GatewayEndpoint) {
        let entry = self.inner.entries.write().remove(endpoint);
        if let Some(entry) = entry {
            warn!(gateway = %endpoint, connections = entry.connections.len(), "aborting endpoint");
            for connection in entry.connections {
                connection.close("aborted by connection manager");
            }
        }
    }

    /// Shut the pool down.
    ///
    /// Rejects new dials, closes every connection and waits until the
    /// reader tasks have drained the pool, or `timeout` elapses.
    pub async fn close(&self, timeout: Duration) {
        self.inner.closing.store(true, Ordering::SeqCst);

        let connections: Vec<Arc<GatewayConnection>> = self
            .inner
            .entries
            .read()
            .values()
            .flat_map(|entry| entry.connections.iter().cloned())
            .collect();
        for connection in connections {
            connection.close("connection manager shutting down");
        }

        let deadline = Instant::now() + timeout;
        let mut last_warn = Instant::now();
        loop {
            let remaining = self.connection_count();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "gave up waiting for connection pool to drain");
                break;
            }
            if last_warn.elapsed() >= self.inner.config.close_warn_interval {
                warn!(remaining, "still waiting for connection pool to drain");
                last_warn = Instant::now();
            }
            tokio::time::sleep(self.inner.config.close_poll_interval).await;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .field("closing", &self.inner.closing.load(Ordering::SeqCst))
            .finish()
    }
}
