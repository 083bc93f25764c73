//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;

use hive_client::{
    ConnectionStatusListener, GatewayConnector, MessageCenter, MessageSink, MessageStream,
    MessagingConfig, TransportError,
};
use hive_discovery::{GatewayConfig, GatewayManager};
use hive_proto::{ActorId, GatewayEndpoint, GatewayUri, Message};

/// Default timeout for test waits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the test log subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// The endpoint of the `n`-th in-memory gateway.
pub fn gateway_addr(n: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 7000 + n).parse().unwrap()
}

/// The URI of the `n`-th in-memory gateway.
pub fn gateway_uri(n: u16) -> GatewayUri {
    GatewayEndpoint::new(gateway_addr(n), 0).uri()
}

#[derive(Default)]
struct EndpointState {
    dials: usize,
    received: Vec<Message>,
    /// Far ends of the inbound streams handed to the client; dropping
    /// them ends the corresponding connections.
    links: Vec<fmpsc::UnboundedSender<Result<Message, TransportError>>>,
}

/// In-memory gateway fabric: a connector whose transports record what the
/// client sends and let tests push messages back or sever links.
pub struct MemoryFabric {
    state: Arc<Mutex<HashMap<SocketAddr, EndpointState>>>,
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            failing: Mutex::new(HashSet::new()),
        })
    }

    /// Dial attempts made against `addr`.
    pub fn dials(&self, addr: SocketAddr) -> usize {
        self.state.lock().get(&addr).map_or(0, |s| s.dials)
    }

    /// Messages the gateway at `addr` has received.
    pub fn received(&self, addr: SocketAddr) -> Vec<Message> {
        self.state
            .lock()
            .get(&addr)
            .map_or_else(Vec::new, |s| s.received.clone())
    }

    pub fn received_count(&self, addr: SocketAddr) -> usize {
        self.state.lock().get(&addr).map_or(0, |s| s.received.len())
    }

    pub fn total_received(&self) -> usize {
        self.state.lock().values().map(|s| s.received.len()).sum()
    }

    /// Make future dials to `addr` fail.
    pub fn set_failing(&self, addr: SocketAddr, failing: bool) {
        if failing {
            self.failing.lock().insert(addr);
        } else {
            self.failing.lock().remove(&addr);
        }
    }

    /// Push a message from the gateway at `addr` to the client.
    pub fn push(&self, addr: SocketAddr, message: Message) {
        if let Some(state) = self.state.lock().get(&addr) {
            if let Some(link) = state.links.last() {
                let _ = link.unbounded_send(Ok(message));
            }
        }
    }

    /// Sever every connection to `addr`; the client observes the streams
    /// ending.
    pub fn sever(&self, addr: SocketAddr) {
        if let Some(state) = self.state.lock().get_mut(&addr) {
            state.links.clear();
        }
    }
}

#[async_trait]
impl GatewayConnector for MemoryFabric {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<(MessageSink, MessageStream), TransportError> {
        if self.failing.lock().contains(&endpoint.addr) {
            return Err(TransportError::Closed);
        }

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, TransportError>>();

        {
            let mut state = self.state.lock();
            let entry = state.entry(endpoint.addr).or_default();
            entry.dials += 1;
            entry.links.push(in_tx);
        }

        // Record everything the client writes on this transport.
        let recorder = Arc::clone(&self.state);
        let addr = endpoint.addr;
        tokio::spawn(async move {
            while let Some(message) = out_rx.next().await {
                recorder.lock().entry(addr).or_default().received.push(message);
            }
        });

        let sink: MessageSink = Box::pin(out_tx.sink_map_err(|_| TransportError::ChannelClosed));
        let stream: MessageStream = Box::pin(in_rx);
        Ok((sink, stream))
    }
}

/// A message center wired to an in-memory fabric with `n` live gateways.
pub struct TestCluster {
    pub center: MessageCenter,
    pub fabric: Arc<MemoryFabric>,
    pub gateways: GatewayManager,
}

impl TestCluster {
    pub fn new(gateway_count: u16, config: MessagingConfig) -> Self {
        Self::with_listener(
            gateway_count,
            config,
            Arc::new(hive_client::NoopStatusListener),
        )
    }

    pub fn with_listener(
        gateway_count: u16,
        config: MessagingConfig,
        listener: Arc<dyn ConnectionStatusListener>,
    ) -> Self {
        init_tracing();
        let fabric = MemoryFabric::new();
        let gateways = GatewayManager::new(
            GatewayConfig::default(),
            (1..=gateway_count).map(gateway_uri).collect(),
        );
        let center = MessageCenter::new(
            config,
            GatewayEndpoint::new("127.0.0.1:4000".parse().unwrap(), 0),
            ActorId::client(),
            gateways.clone(),
            fabric.clone(),
            listener,
        );
        Self {
            center,
            fabric,
            gateways,
        }
    }
}

/// An actor id whose bucket, in a table of `buckets` slots, is `bucket`.
pub fn actor_in_bucket(buckets: usize, bucket: usize) -> ActorId {
    loop {
        let actor = ActorId::grain();
        if actor.stable_hash() as usize % buckets == bucket {
            return actor;
        }
    }
}
