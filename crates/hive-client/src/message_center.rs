//! The client-side message center.
//!
//! Multiplexes outbound requests across the live gateway set and surfaces
//! gateway-originated messages to the upper layers. Ordered requests to
//! the same actor stick to one gateway through the bucket table; system
//! and unordered traffic round-robins across every live gateway; pinned
//! messages go where they say or are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hive_discovery::GatewayManager;
use hive_proto::{
    ActorId, ActorKind, Direction, GatewayEndpoint, GatewayUri, Message, MessageCategory,
    RejectionKind,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buckets::BucketTable;
use crate::config::MessagingConfig;
use crate::connection::{GatewayConnection, InboundSink};
use crate::connection_manager::ConnectionManager;
use crate::error::ClientError;
use crate::status::{ConnectionStatusListener, GatewayCountObserver};
use crate::transport::GatewayConnector;

/// Lifecycle state of the message center. Transitions are one-way:
/// `Constructed → Running → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CenterState {
    /// Built but not started.
    Constructed,
    /// Accepting traffic.
    Running,
    /// Terminally stopped.
    Stopped,
}

/// Atomic wrapper for the lifecycle state.
struct AtomicCenterState(AtomicU32);

impl AtomicCenterState {
    const fn new() -> Self {
        Self(AtomicU32::new(CenterState::Constructed as u32))
    }

    fn load(&self) -> CenterState {
        match self.0.load(Ordering::SeqCst) {
            0 => CenterState::Constructed,
            1 => CenterState::Running,
            _ => CenterState::Stopped,
        }
    }

    /// One-way transition; returns whether this call performed it.
    fn transition(&self, from: CenterState, to: CenterState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A synchronous inbound message handler.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Inbound dispatch: the handler table and the shared inbound queue.
///
/// Shared between the message center and every connection's reader task;
/// deliberately free of any reference back to the connection pool so that
/// connection → dispatch edges never form a cycle.
pub(crate) struct MessageDispatch {
    state: AtomicCenterState,
    inbound_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    handlers: RwLock<HashMap<MessageCategory, MessageHandler>>,
}

impl MessageDispatch {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            state: AtomicCenterState::new(),
            inbound_tx: RwLock::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn state(&self) -> CenterState {
        self.state.load()
    }

    fn on_received(&self, message: Message) {
        match self.state.load() {
            CenterState::Stopped => {
                warn!(
                    category = ?message.category,
                    "dropping inbound message received after stop"
                );
                return;
            }
            CenterState::Running => {
                let handler = self.handlers.read().get(&message.category).cloned();
                if let Some(handler) = handler {
                    handler(message);
                    return;
                }
            }
            // Before start, everything queues; handlers only run once the
            // center is running.
            CenterState::Constructed => {}
        }

        let queued = match self.inbound_tx.read().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if !queued {
            warn!("inbound queue is closed; dropping message");
        }
    }

    /// Drop the queue's sender. Terminal: once closed, the reader drains
    /// whatever was queued and then observes end-of-stream.
    fn close_queue(&self) {
        *self.inbound_tx.write() = None;
    }

    fn take_reader(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbound_rx.lock().take()
    }

    fn register_handler(&self, category: MessageCategory, handler: MessageHandler) {
        self.handlers.write().insert(category, handler);
    }
}

impl InboundSink for MessageDispatch {
    fn deliver(&self, message: Message) {
        self.on_received(message);
    }
}

/// Where a message should go, decided synchronously.
enum Route {
    /// A live connection is at hand; send inline.
    Connection(Arc<GatewayConnection>),
    /// A dial (or dial wait) is required.
    Dial {
        endpoint: GatewayEndpoint,
        uri: GatewayUri,
        /// Bucket to install the resulting connection into, for sticky
        /// routing.
        bucket: Option<usize>,
        /// Pinned messages are rejected, not re-routed, when the dial
        /// fails.
        pinned: bool,
    },
    /// Selection failed terminally for this message.
    Reject(String),
}

struct CenterInner {
    config: MessagingConfig,
    my_address: GatewayEndpoint,
    client_id: RwLock<ActorId>,
    dispatch: Arc<MessageDispatch>,
    gateways: GatewayManager,
    connections: ConnectionManager,
    buckets: BucketTable,
    /// Monotonic counter driving round-robin gateway selection for
    /// unordered and system-target traffic.
    num_messages: AtomicU64,
    observer: Arc<GatewayCountObserver>,
}

/// The public send/receive surface of the client messaging stack.
///
/// Cheap to clone; clones share one underlying center.
#[derive(Clone)]
pub struct MessageCenter {
    inner: Arc<CenterInner>,
}

impl MessageCenter {
    /// Create a message center.
    ///
    /// `gateways` supplies the live gateway set, `connector` dials
    /// transports, and `listener` observes connection-count transitions.
    #[must_use]
    pub fn new(
        config: MessagingConfig,
        my_address: GatewayEndpoint,
        client_id: ActorId,
        gateways: GatewayManager,
        connector: Arc<dyn GatewayConnector>,
        listener: Arc<dyn ConnectionStatusListener>,
    ) -> Self {
        let dispatch = Arc::new(MessageDispatch::new());
        let observer = Arc::new(GatewayCountObserver::new(listener));
        let inbound: Arc<dyn InboundSink> = Arc::clone(&dispatch) as Arc<dyn InboundSink>;
        let connections = ConnectionManager::new(
            config.clone(),
            connector,
            inbound,
            Arc::clone(&observer),
        );
        let buckets = BucketTable::new(config.client_sender_buckets);
        Self {
            inner: Arc::new(CenterInner {
                config,
                my_address,
                client_id: RwLock::new(client_id),
                dispatch,
                gateways,
                connections,
                buckets,
                num_messages: AtomicU64::new(0),
                observer,
            }),
        }
    }

    /// Start accepting traffic. Idempotent while running.
    ///
    /// # Errors
    ///
    /// Returns an error when called on a stopped center; the lifecycle is
    /// one-way.
    pub fn start(&self) -> Result<(), ClientError> {
        if self
            .inner
            .dispatch
            .state
            .transition(CenterState::Constructed, CenterState::Running)
        {
            self.inner.gateways.start();
            info!(address = %self.inner.my_address, "message center started");
            return Ok(());
        }
        match self.state() {
            CenterState::Running => Ok(()),
            _ => Err(ClientError::InvalidState(
                "cannot start a stopped message center".to_string(),
            )),
        }
    }

    /// Stop accepting traffic, close the inbound queue and stop gateway
    /// discovery. Idempotent; the transition is one-way.
    pub fn stop(&self) {
        let dispatch = &self.inner.dispatch;
        let stopped = dispatch
            .state
            .transition(CenterState::Running, CenterState::Stopped)
            || dispatch
                .state
                .transition(CenterState::Constructed, CenterState::Stopped);
        if !stopped {
            return;
        }
        dispatch.close_queue();
        self.inner.gateways.stop();
        info!("message center stopped");
    }

    /// Stop and release resources; the connection pool is drained in the
    /// background. Idempotent.
    pub fn dispose(&self) {
        self.stop();
        self.inner.gateways.dispose();
        let connections = self.inner.connections.clone();
        let timeout = self.inner.config.close_timeout;
        tokio::spawn(async move {
            connections.close(timeout).await;
        });
    }

    /// Stop and wait for the connection pool to drain, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        self.inner.gateways.dispose();
        self.inner.connections.close(timeout).await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CenterState {
        self.inner.dispatch.state()
    }

    /// Whether the center is running.
    #[must_use]
    pub fn running(&self) -> bool {
        self.state() == CenterState::Running
    }

    /// The client's own address.
    #[must_use]
    pub fn my_address(&self) -> GatewayEndpoint {
        self.inner.my_address
    }

    /// The client's identity.
    #[must_use]
    pub fn client_id(&self) -> ActorId {
        *self.inner.client_id.read()
    }

    /// Replace the client identity.
    ///
    /// Only the `Client → GeoClient` transition is permitted.
    ///
    /// # Errors
    ///
    /// Returns an error for any other transition.
    pub fn update_client_id(&self, new_id: ActorId) -> Result<(), ClientError> {
        let mut client_id = self.inner.client_id.write();
        if client_id.kind() == ActorKind::Client && new_id.kind() == ActorKind::GeoClient {
            *client_id = new_id;
            Ok(())
        } else {
            Err(ClientError::InvalidState(format!(
                "cannot change client id kind from {:?} to {:?}",
                client_id.kind(),
                new_id.kind()
            )))
        }
    }

    /// Number of currently open gateway connections.
    #[must_use]
    pub fn gateway_count(&self) -> usize {
        self.inner.observer.count()
    }

    /// Outbound queue length. Always 0: sends are handed straight to
    /// their connection. Retained for contract compatibility.
    #[must_use]
    pub fn send_queue_length(&self) -> usize {
        0
    }

    /// Inbound queue length. Always 0; retained for contract
    /// compatibility.
    #[must_use]
    pub fn receive_queue_length(&self) -> usize {
        0
    }

    /// Send a message towards its actor. Fire-and-forget: failures come
    /// back, if at all, as rejection responses on the inbound path.
    pub fn send_message(&self, message: Message) {
        CenterInner::submit(&self.inner, message);
    }

    /// Feed a gateway-originated message into the inbound path.
    ///
    /// A registered handler for the message's category is invoked
    /// synchronously; otherwise the message is queued for the reader.
    pub fn on_received_message(&self, message: Message) {
        self.inner.dispatch.on_received(message);
    }

    /// The reader end of the inbound queue.
    ///
    /// There is exactly one reader: the first call returns it, later calls
    /// return `None`. Categories are not demultiplexed; the caller
    /// filters.
    #[must_use]
    pub fn reader(&self, _category: MessageCategory) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inner.dispatch.take_reader()
    }

    /// Register a synchronous handler for a category. Last writer wins;
    /// there is no removal.
    pub fn register_local_message_handler(
        &self,
        category: MessageCategory,
        handler: MessageHandler,
    ) {
        self.inner.dispatch.register_handler(category, handler);
    }

    /// Reject a message: requests produce a synthetic rejection response
    /// on the inbound path, anything else is dropped.
    pub fn reject_message(
        &self,
        message: Message,
        reason: impl Into<String>,
        cause: Option<&dyn std::error::Error>,
    ) {
        self.inner.reject(message, &reason.into(), cause);
    }
}

impl CenterInner {
    /// Run the selection rules for one message and dispatch it.
    fn submit(inner: &Arc<Self>, message: Message) {
        if inner.dispatch.state() != CenterState::Running {
            inner.reject(message, "Message center is not running", None);
            return;
        }
        match inner.route(&message) {
            Route::Connection(connection) => Self::dispatch_send(inner, &connection, message),
            Route::Dial {
                endpoint,
                uri,
                bucket,
                pinned,
            } => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    Self::dial_and_send(&inner, endpoint, uri, bucket, pinned, message).await;
                });
            }
            Route::Reject(reason) => inner.reject(message, &reason, None),
        }
    }

    /// Selection rules, in priority order: pinned target, then
    /// round-robin for system/unordered traffic, then the sticky bucket.
    fn route(&self, message: &Message) -> Route {
        if let Some(pinned) = message.target_endpoint {
            let uri = pinned.uri();
            if self.gateways.is_live(&uri) {
                return match uri.to_endpoint() {
                    Ok(endpoint) => match self.connections.try_get(&endpoint) {
                        Some(connection) => Route::Connection(connection),
                        None => Route::Dial {
                            endpoint,
                            uri,
                            bucket: None,
                            pinned: true,
                        },
                    },
                    Err(e) => Route::Reject(format!("Target gateway {uri} is unavailable: {e}")),
                };
            }
            // A pinned but dead gateway falls through to the other rules.
        }

        if message.target_actor.is_system_target() || message.unordered {
            let live = self.gateways.live_gateways();
            if live.is_empty() {
                return Route::Reject(ClientError::NoGatewaysAvailable.to_string());
            }
            let n = self.num_messages.fetch_add(1, Ordering::Relaxed) as usize;
            let uri = live[n % live.len()].clone();
            return match uri.to_endpoint() {
                Ok(endpoint) => match self.connections.try_get(&endpoint) {
                    Some(connection) => Route::Connection(connection),
                    None => Route::Dial {
                        endpoint,
                        uri,
                        bucket: None,
                        pinned: false,
                    },
                },
                Err(e) => Route::Reject(format!("invalid gateway uri {uri}: {e}")),
            };
        }

        let index = self.buckets.index_of(&message.target_actor);
        if let Some(connection) = self.buckets.get(index) {
            return Route::Connection(connection);
        }
        let Some(uri) = self.gateways.live_gateway() else {
            return Route::Reject(ClientError::NoGatewaysAvailable.to_string());
        };
        match uri.to_endpoint() {
            Ok(endpoint) => Route::Dial {
                endpoint,
                uri,
                bucket: Some(index),
                pinned: false,
            },
            Err(e) => Route::Reject(format!("invalid gateway uri {uri}: {e}")),
        }
    }

    /// Await the dial decided by [`CenterInner::route`], then send.
    async fn dial_and_send(
        inner: &Arc<Self>,
        endpoint: GatewayEndpoint,
        uri: GatewayUri,
        bucket: Option<usize>,
        pinned: bool,
        message: Message,
    ) {
        match inner.connections.get_connection(&endpoint).await {
            Ok(connection) => {
                // For sticky routing, whoever wins the bucket install is
                // the connection this message takes.
                let connection = match bucket {
                    Some(index) => inner.buckets.install(index, &connection),
                    None => connection,
                };
                Self::dispatch_send(inner, &connection, message);
            }
            Err(e) => {
                warn!(gateway = %uri, error = %e, "marking gateway dead after connection failure");
                inner.gateways.mark_dead(&uri);
                if pinned {
                    let reason = format!("Target gateway {uri} is unavailable");
                    inner.reject(message, &reason, Some(&e));
                } else {
                    // Re-run the whole selection; some other gateway may
                    // still take this message.
                    Self::submit(inner, message);
                }
            }
        }
    }

    /// Hand the message to its connection, handling a lost race with a
    /// concurrent close.
    fn dispatch_send(inner: &Arc<Self>, connection: &Arc<GatewayConnection>, message: Message) {
        let pinned = message.target_endpoint;
        match connection.send(message) {
            Ok(()) => {}
            Err(returned) => {
                if let Some(pinned) = pinned {
                    let reason = format!("Target gateway {} is unavailable", pinned.uri());
                    inner.reject(returned, &reason, None);
                } else {
                    // Lost the race with a closing connection; retry after
                    // a pause. The retry is unscheduled on purpose: one
                    // launched just before stop observes the stopped state
                    // and drops.
                    debug!(gateway = %connection.endpoint(), "send lost race with close; scheduling retry");
                    let inner = Arc::clone(inner);
                    let delay = inner.config.send_retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        Self::submit(&inner, returned);
                    });
                }
            }
        }
    }

    fn reject(&self, message: Message, reason: &str, cause: Option<&dyn std::error::Error>) {
        if self.dispatch.state() != CenterState::Running {
            debug!(reason, "dropping message while not running");
            return;
        }
        if message.direction != Direction::Request {
            debug!(
                reason,
                direction = ?message.direction,
                "dropping non-request message"
            );
            return;
        }
        warn!(actor = %message.target_actor, reason, "rejecting request");
        let response =
            Message::rejection_response(&message, RejectionKind::Unrecoverable, reason, cause);
        self.dispatch.on_received(response);
    }
}

impl std::fmt::Debug for MessageCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCenter")
            .field("state", &self.state())
            .field("address", &self.inner.my_address)
            .field("gateway_count", &self.gateway_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hive_discovery::GatewayConfig;
    use hive_proto::ProtoError;

    use crate::status::NoopStatusListener;
    use crate::transport::{MessageSink, MessageStream, TransportError};

    /// Connector for paths that never reach the network.
    struct RefusingConnector;

    #[async_trait]
    impl GatewayConnector for RefusingConnector {
        async fn connect(
            &self,
            _endpoint: &GatewayEndpoint,
        ) -> Result<(MessageSink, MessageStream), TransportError> {
            Err(TransportError::Frame(ProtoError::Validation(
                "refused by test connector".to_string(),
            )))
        }
    }

    fn center_with_gateways(uris: Vec<&str>) -> MessageCenter {
        let gateways = GatewayManager::new(
            GatewayConfig::default(),
            uris.into_iter().map(GatewayUri::new).collect(),
        );
        MessageCenter::new(
            MessagingConfig::default(),
            GatewayEndpoint::new("127.0.0.1:4000".parse().unwrap(), 0),
            ActorId::client(),
            gateways,
            Arc::new(RefusingConnector),
            Arc::new(NoopStatusListener),
        )
    }

    fn center() -> MessageCenter {
        center_with_gateways(Vec::new())
    }

    #[tokio::test]
    async fn test_lifecycle_one_way() {
        let center = center();
        assert_eq!(center.state(), CenterState::Constructed);

        center.start().expect("should start");
        assert!(center.running());
        center.start().expect("second start is a no-op");

        center.stop();
        assert_eq!(center.state(), CenterState::Stopped);
        center.stop(); // idempotent

        let err = center.start().expect_err("restart must fail");
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_send_before_start_drops() {
        let center = center();
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        center.send_message(Message::request(ActorId::grain()));

        // Not running: the message is dropped without a rejection.
        assert!(reader.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_with_no_gateways_is_rejected() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        let request = Message::request(ActorId::grain());
        let request_id = request.id;
        center.send_message(request);

        let rejection = reader.recv().await.expect("rejection should arrive");
        assert!(rejection.is_rejection());
        assert_eq!(rejection.correlation_id, Some(request_id));
        let payload = rejection.rejection.expect("payload");
        assert_eq!(payload.kind, RejectionKind::Unrecoverable);
        assert_eq!(payload.reason, "No gateways available");
    }

    #[tokio::test]
    async fn test_non_request_with_no_gateways_is_dropped() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        center.send_message(Message::one_way(ActorId::grain()));

        assert!(reader.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_message_only_rejects_requests() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        center.reject_message(Message::one_way(ActorId::grain()), "dropped", None);
        assert!(reader.try_recv().is_err());

        center.reject_message(Message::request(ActorId::grain()), "bad luck", None);
        let rejection = reader.recv().await.expect("rejection should arrive");
        assert_eq!(rejection.rejection.expect("payload").reason, "bad luck");
    }

    #[tokio::test]
    async fn test_reject_message_is_noop_when_stopped() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");
        center.stop();

        center.reject_message(Message::request(ActorId::grain()), "too late", None);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handler_takes_precedence_over_queue() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        let seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        center.register_local_message_handler(
            MessageCategory::System,
            Arc::new(move |message| sink.lock().push(message)),
        );

        let system = Message::request(ActorId::grain()).with_category(MessageCategory::System);
        center.on_received_message(system);
        let application = Message::request(ActorId::grain());
        center.on_received_message(application.clone());

        assert_eq!(seen.lock().len(), 1);
        let queued = reader.recv().await.expect("application message queued");
        assert_eq!(queued.id, application.id);
    }

    #[tokio::test]
    async fn test_inbound_queued_before_start_is_readable() {
        let center = center();
        let message = Message::request(ActorId::grain());
        center.on_received_message(message.clone());

        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");
        assert_eq!(reader.recv().await.expect("queued").id, message.id);
    }

    #[tokio::test]
    async fn test_stop_closes_queue_for_reader() {
        let center = center();
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        center.stop();

        // End of stream, not an error.
        assert!(reader.recv().await.is_none());

        // Inbound messages after stop are dropped.
        center.on_received_message(Message::request(ActorId::grain()));
    }

    #[tokio::test]
    async fn test_reader_is_single_take() {
        let center = center();
        assert!(center.reader(MessageCategory::Application).is_some());
        assert!(center.reader(MessageCategory::System).is_none());
    }

    #[tokio::test]
    async fn test_update_client_id_transitions() {
        let center = center();
        assert_eq!(center.client_id().kind(), ActorKind::Client);

        let geo = center.client_id().with_kind(ActorKind::GeoClient);
        center.update_client_id(geo).expect("client to geo_client is valid");
        assert_eq!(center.client_id().kind(), ActorKind::GeoClient);

        // Any further transition is invalid.
        let err = center
            .update_client_id(ActorId::new(ActorKind::GeoClient))
            .expect_err("geo_client cannot transition again");
        assert!(matches!(err, ClientError::InvalidState(_)));

        let err = center
            .update_client_id(ActorId::client())
            .expect_err("downgrade is invalid");
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_queue_length_properties_are_zero() {
        let center = center();
        assert_eq!(center.send_queue_length(), 0);
        assert_eq!(center.receive_queue_length(), 0);
        assert_eq!(center.gateway_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_dial_marks_gateway_dead_and_rejects() {
        let center = center_with_gateways(vec!["ws://127.0.0.1:59999"]);
        center.start().expect("should start");
        let mut reader = center.reader(MessageCategory::Application).expect("reader");

        center.send_message(Message::request(ActorId::grain()));

        // The refusing connector fails the dial; the only gateway is
        // marked dead and selection restarts into an empty live set.
        let rejection = reader.recv().await.expect("rejection should arrive");
        assert!(rejection.is_rejection());
        assert_eq!(
            rejection.rejection.expect("payload").reason,
            "No gateways available"
        );
    }
}
