//! A single live connection to one gateway.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use hive_proto::{GatewayEndpoint, Message};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::transport::{MessageSink, MessageStream};

/// Receiver of messages arriving on a connection's read side.
///
/// Implemented by the message center's inbound dispatch; connections only
/// push, they never wait on the receiver.
pub trait InboundSink: Send + Sync {
    /// Deliver one inbound message.
    fn deliver(&self, message: Message);
}

/// One bidirectional transport to one gateway.
///
/// Identity is fixed at creation; `valid` flips exactly once, from true to
/// false, when the connection closes for any reason. Sends are synchronous
/// pushes onto an unbounded outbound queue drained in FIFO order by
/// [`GatewayConnection::run`], which is what preserves per-connection
/// request ordering.
pub struct GatewayConnection {
    endpoint: GatewayEndpoint,
    outbound_tx: mpsc::UnboundedSender<Message>,
    /// Taken exactly once by the run loop.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    queued: AtomicUsize,
    valid: AtomicBool,
    close_signal: Notify,
    close_reason: Mutex<Option<String>>,
    /// Latch ensuring removal and count notifications fire exactly once.
    closed_latch: AtomicBool,
}

impl GatewayConnection {
    /// Create a connection shell for the given endpoint.
    ///
    /// The connection is not live until [`GatewayConnection::run`] is
    /// driving its transport halves.
    #[must_use]
    pub fn new(endpoint: GatewayEndpoint) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            queued: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
            close_signal: Notify::new(),
            close_reason: Mutex::new(None),
            closed_latch: AtomicBool::new(false),
        }
    }

    /// The gateway this connection is attached to.
    #[must_use]
    pub const fn endpoint(&self) -> &GatewayEndpoint {
        &self.endpoint
    }

    /// Whether the connection is still usable for sends.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Why the connection closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Messages queued for the writer.
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Queue a message for transmission.
    ///
    /// # Errors
    ///
    /// Returns the message back if the connection closed before it could
    /// be queued, so the caller can retry it elsewhere.
    pub fn send(&self, message: Message) -> Result<(), Message> {
        if !self.is_valid() {
            return Err(message);
        }
        match self.outbound_tx.send(message) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(rejected) => Err(rejected.0),
        }
    }

    /// Close the connection.
    ///
    /// The first call wins: it records the reason, invalidates the
    /// connection and wakes the run loop. Later calls are no-ops.
    pub fn close(&self, reason: impl Into<String>) {
        if self.valid.swap(false, Ordering::SeqCst) {
            let reason = reason.into();
            debug!(gateway = %self.endpoint, reason = %reason, "closing connection");
            *self.close_reason.lock() = Some(reason);
            self.close_signal.notify_one();
        }
    }

    /// Record that lifecycle teardown ran. Returns true exactly once.
    pub(crate) fn latch_closed(&self) -> bool {
        !self.closed_latch.swap(true, Ordering::SeqCst)
    }

    /// Drive the transport until it closes.
    ///
    /// Drains the outbound queue into `sink` and forwards everything read
    /// from `stream` into `inbound`. Returns the close reason. The
    /// connection is invalid by the time this returns.
    pub async fn run(
        &self,
        mut sink: MessageSink,
        mut stream: MessageStream,
        inbound: &dyn InboundSink,
    ) -> String {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            warn!(gateway = %self.endpoint, "connection run loop started twice");
            return "already running".to_string();
        };

        let reason = loop {
            tokio::select! {
                () = self.close_signal.notified() => {
                    break self
                        .close_reason
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "closed".to_string());
                }

                outgoing = outbound_rx.recv() => {
                    // The sender lives on self, so the queue cannot close
                    // while the connection is alive.
                    let Some(message) = outgoing else {
                        break "outbound queue closed".to_string();
                    };
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = sink.send(message).await {
                        break format!("write failed: {e}");
                    }
                }

                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(message)) => inbound.deliver(message),
                        Some(Err(e)) => break format!("read failed: {e}"),
                        None => break "closed by gateway".to_string(),
                    }
                }
            }
        };

        self.valid.store(false, Ordering::SeqCst);
        {
            let mut stored = self.close_reason.lock();
            if stored.is_none() {
                *stored = Some(reason.clone());
            }
        }
        let _ = sink.close().await;
        reason
    }
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("endpoint", &self.endpoint)
            .field("valid", &self.is_valid())
            .field("queued", &self.queued_messages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use hive_proto::ActorId;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::transport::TransportError;

    fn endpoint() -> GatewayEndpoint {
        GatewayEndpoint::new("127.0.0.1:18789".parse().unwrap(), 1)
    }

    /// Transport halves backed by in-process channels, plus the far ends.
    fn memory_transport() -> (
        MessageSink,
        MessageStream,
        fmpsc::UnboundedReceiver<Message>,
        fmpsc::UnboundedSender<Result<Message, TransportError>>,
    ) {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, TransportError>>();
        let sink: MessageSink =
            Box::pin(out_tx.sink_map_err(|_| TransportError::ChannelClosed));
        let stream: MessageStream = Box::pin(in_rx);
        (sink, stream, out_rx, in_tx)
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Message>>);

    impl InboundSink for Collecting {
        fn deliver(&self, message: Message) {
            self.0.lock().push(message);
        }
    }

    #[test]
    fn test_new_connection_is_valid() {
        let conn = GatewayConnection::new(endpoint());
        assert!(conn.is_valid());
        assert!(conn.close_reason().is_none());
        assert_eq!(conn.queued_messages(), 0);
    }

    #[test]
    fn test_close_is_first_writer_wins() {
        let conn = GatewayConnection::new(endpoint());
        conn.close("first");
        conn.close("second");
        assert!(!conn.is_valid());
        assert_eq!(conn.close_reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_send_after_close_returns_message() {
        let conn = GatewayConnection::new(endpoint());
        conn.close("gone");
        let message = Message::request(ActorId::grain());
        let rejected = conn.send(message.clone()).expect_err("should reject");
        assert_eq!(rejected, message);
    }

    #[tokio::test]
    async fn test_run_drains_outbound_in_order() {
        let conn = Arc::new(GatewayConnection::new(endpoint()));
        let (sink, stream, mut far_rx, _far_tx) = memory_transport();
        let inbound = Arc::new(Collecting::default());

        let first = Message::request(ActorId::grain());
        let second = Message::request(ActorId::grain());
        conn.send(first.clone()).expect("should queue");
        conn.send(second.clone()).expect("should queue");

        let runner = {
            let conn = Arc::clone(&conn);
            let inbound = Arc::clone(&inbound);
            tokio::spawn(async move { conn.run(sink, stream, inbound.as_ref()).await })
        };

        let got_first = far_rx.next().await.expect("first message");
        let got_second = far_rx.next().await.expect("second message");
        assert_eq!(got_first.id, first.id);
        assert_eq!(got_second.id, second.id);

        conn.close("test over");
        let reason = runner.await.expect("run should finish");
        assert_eq!(reason, "test over");
        assert!(!conn.is_valid());
    }

    #[tokio::test]
    async fn test_run_forwards_inbound_and_ends_on_stream_close() {
        let conn = Arc::new(GatewayConnection::new(endpoint()));
        let (sink, stream, _far_rx, far_tx) = memory_transport();
        let inbound = Arc::new(Collecting::default());

        let runner = {
            let conn = Arc::clone(&conn);
            let inbound = Arc::clone(&inbound);
            tokio::spawn(async move { conn.run(sink, stream, inbound.as_ref()).await })
        };

        let pushed = Message::request(ActorId::grain());
        far_tx.unbounded_send(Ok(pushed.clone())).expect("push");
        drop(far_tx);

        let reason = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("run should end")
            .expect("no panic");
        assert_eq!(reason, "closed by gateway");
        assert_eq!(inbound.0.lock().len(), 1);
        assert_eq!(inbound.0.lock()[0].id, pushed.id);
        assert!(!conn.is_valid());
        assert_eq!(conn.close_reason().as_deref(), Some("closed by gateway"));
    }

    #[tokio::test]
    async fn test_run_ends_on_read_error() {
        let conn = Arc::new(GatewayConnection::new(endpoint()));
        let (sink, stream, _far_rx, far_tx) = memory_transport();
        let inbound = Collecting::default();

        far_tx
            .unbounded_send(Err(TransportError::Closed))
            .expect("push error");

        let reason = conn.run(sink, stream, &inbound).await;
        assert!(reason.starts_with("read failed"), "reason: {reason}");
    }

    #[test]
    fn test_latch_closes_once() {
        let conn = GatewayConnection::new(endpoint());
        assert!(conn.latch_closed());
        assert!(!conn.latch_closed());
    }
}
