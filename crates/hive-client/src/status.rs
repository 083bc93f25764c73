//! Connection-count observation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Observer of cluster connectivity transitions.
pub trait ConnectionStatusListener: Send + Sync {
    /// The number of open gateway connections changed.
    fn gateway_count_changed(&self, new_count: usize, old_count: usize);

    /// The last gateway connection closed.
    fn cluster_connection_lost(&self);
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusListener;

impl ConnectionStatusListener for NoopStatusListener {
    fn gateway_count_changed(&self, _new_count: usize, _old_count: usize) {}

    fn cluster_connection_lost(&self) {}
}

/// Tracks the number of open gateway connections and forwards transitions
/// to the registered listener.
///
/// `connection_opened` and `connection_closed` are invoked from connection
/// lifecycle paths; the count therefore always equals the number of
/// connections currently observed open through those hooks.
pub struct GatewayCountObserver {
    count: AtomicUsize,
    listener: Arc<dyn ConnectionStatusListener>,
}

impl GatewayCountObserver {
    /// Create an observer forwarding to `listener`.
    #[must_use]
    pub fn new(listener: Arc<dyn ConnectionStatusListener>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            listener,
        }
    }

    /// Current number of open connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Record a newly opened connection.
    pub fn connection_opened(&self) {
        let new_count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(connections = new_count, "gateway connection opened");
        self.listener.gateway_count_changed(new_count, new_count - 1);
    }

    /// Record a closed connection.
    pub fn connection_closed(&self) {
        let new_count = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(connections = new_count, "gateway connection closed");
        if new_count == 0 {
            self.listener.cluster_connection_lost();
        }
        self.listener.gateway_count_changed(new_count, new_count + 1);
    }
}

impl std::fmt::Debug for GatewayCountObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCountObserver")
            .field("count", &self.count())
            .finish()
    }
}
