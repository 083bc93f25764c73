//! Live-gateway bookkeeping with quarantine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hive_proto::GatewayUri;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Errors that can occur during gateway selection.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Every known gateway is quarantined or none were configured.
    #[error("no live gateways")]
    NoLiveGateways,
}

/// Configuration for gateway bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How often the refresh task sweeps the quarantine.
    pub refresh_interval: Duration,
    /// How long a dead gateway stays benched before it is retried.
    pub quarantine_period: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            quarantine_period: Duration::from_secs(60),
        }
    }
}

/// Observer of live-set transitions.
pub trait GatewayListener: Send + Sync {
    /// Called whenever the live gateway list changes.
    fn gateway_list_changed(&self, live_count: usize);
}

struct ManagerInner {
    config: GatewayConfig,
    /// Ordered live list. Restored gateways are appended, not re-inserted
    /// at their old position.
    live: RwLock<Vec<GatewayUri>>,
    /// Benched gateways with the time they were marked dead.
    dead: RwLock<HashMap<GatewayUri, Instant>>,
    listener: RwLock<Option<Arc<dyn GatewayListener>>>,
    running: AtomicBool,
}

/// Tracks which gateways are eligible for client traffic.
///
/// Gateways marked dead are quarantined with a timestamp; a background
/// refresh task started by [`GatewayManager::start`] returns them to the
/// live list once the quarantine period has elapsed. Known gateways are
/// never forgotten: they are either live or benched.
///
/// Cheap to clone; clones share one underlying manager.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<ManagerInner>,
}

impl GatewayManager {
    /// Create a manager seeded with an ordered gateway list.
    #[must_use]
    pub fn new(config: GatewayConfig, gateways: Vec<GatewayUri>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                live: RwLock::new(gateways),
                dead: RwLock::new(HashMap::new()),
                listener: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register the live-set listener. Last writer wins.
    pub fn set_listener(&self, listener: Arc<dyn GatewayListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Ordered snapshot of the live gateways.
    #[must_use]
    pub fn live_gateways(&self) -> Vec<GatewayUri> {
        self.inner.live.read().clone()
    }

    /// Number of live gateways.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.live.read().len()
    }

    /// Whether the given gateway is currently live.
    #[must_use]
    pub fn is_live(&self, uri: &GatewayUri) -> bool {
        self.inner.live.read().contains(uri)
    }

    /// Pseudo-random pick among the live gateways.
    ///
    /// # Errors
    ///
    /// Returns an error if no gateway is live.
    pub fn select(&self) -> Result<GatewayUri, DiscoveryError> {
        let live = self.inner.live.read();
        if live.is_empty() {
            return Err(DiscoveryError::NoLiveGateways);
        }
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..live.len());
        Ok(live[index].clone())
    }

    /// Pseudo-random pick among the live gateways, `None` when empty.
    #[must_use]
    pub fn live_gateway(&self) -> Option<GatewayUri> {
        self.select().ok()
    }

    /// Quarantine a gateway.
    ///
    /// The gateway is removed from the live list and benched until the
    /// quarantine period elapses. Marking an already-dead gateway resets
    /// its quarantine clock.
    pub fn mark_dead(&self, uri: &GatewayUri) {
        let live_count = {
            let mut live = self.inner.live.write();
            live.retain(|g| g != uri);
            live.len()
        };
        self.inner.dead.write().insert(uri.clone(), Instant::now());

        if live_count == 0 {
            error!(gateway = %uri, "marked last live gateway as dead");
        } else {
            warn!(gateway = %uri, live = live_count, "marked gateway as dead");
        }
        self.notify(live_count);
    }

    /// Add a gateway at runtime.
    ///
    /// A gateway that is already live is left untouched; a benched one is
    /// revived immediately.
    pub fn add_gateway(&self, uri: GatewayUri) {
        let live_count = {
            let mut live = self.inner.live.write();
            if live.contains(&uri) {
                return;
            }
            self.inner.dead.write().remove(&uri);
            live.push(uri.clone());
            live.len()
        };
        info!(gateway = %uri, live = live_count, "added gateway");
        self.notify(live_count);
    }

    /// Return benched gateways whose quarantine has elapsed to the live
    /// list. Returns how many were restored.
    ///
    /// Restored gateways are appended at the end of the live list so a
    /// freshly revived gateway does not immediately absorb round-robin
    /// traffic from the head.
    pub fn restore_expired(&self) -> usize {
        let expired: Vec<GatewayUri> = {
            let now = Instant::now();
            let mut dead = self.inner.dead.write();
            let expired: Vec<GatewayUri> = dead
                .iter()
                .filter(|(_, since)| {
                    now.duration_since(**since) >= self.inner.config.quarantine_period
                })
                .map(|(uri, _)| uri.clone())
                .collect();
            for uri in &expired {
                dead.remove(uri);
            }
            expired
        };

        if expired.is_empty() {
            return 0;
        }

        let live_count = {
            let mut live = self.inner.live.write();
            for uri in &expired {
                if !live.contains(uri) {
                    live.push(uri.clone());
                }
            }
            live.len()
        };
        for uri in &expired {
            info!(gateway = %uri, "gateway restored after quarantine");
        }
        self.notify(live_count);
        expired.len()
    }

    /// Start the quarantine refresh task.
    ///
    /// Idempotent; a second call while running is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.config.refresh_interval);
            // The first tick completes immediately; skip it so a sweep
            // never races the caller's setup.
            ticker.tick().await;
            while manager.is_running() {
                ticker.tick().await;
                if !manager.is_running() {
                    break;
                }
                let restored = manager.restore_expired();
                if restored > 0 {
                    debug!(restored, "quarantine sweep restored gateways");
                }
            }
        });
    }

    /// Stop the refresh task. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Release the manager. Equivalent to [`GatewayManager::stop`]; held
    /// snapshots remain readable.
    pub fn dispose(&self) {
        self.stop();
    }

    /// Whether the refresh task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn notify(&self, live_count: usize) {
        let listener = self.inner.listener.read().clone();
        if let Some(listener) = listener {
            listener.gateway_list_changed(live_count);
        }
    }
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("live", &self.live_count())
            .field("dead", &self.inner.dead.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}
