//! The dial seam between the connection pool and the network.
//!
//! A [`GatewayConnector`] turns a [`GatewayEndpoint`] into a pair of
//! message-level halves: a sink for outbound messages and a stream of
//! inbound ones. The production implementation speaks WebSocket with JSON
//! text frames; tests substitute in-memory channels behind the same trait.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hive_proto::{GatewayEndpoint, Message, ProtoError};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

/// Errors that can occur on the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] ProtoError),

    /// The dial did not complete in time.
    #[error("dial timed out")]
    Timeout,

    /// The peer closed the transport.
    #[error("transport closed by peer")]
    Closed,

    /// The in-process channel backing the transport is gone.
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Outbound half of a gateway transport.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = TransportError> + Send>>;

/// Inbound half of a gateway transport.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// Asynchronously produces a live transport for a gateway endpoint.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Dial the endpoint and return the transport halves.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial or the protocol handshake fails.
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<(MessageSink, MessageStream), TransportError>;
}

/// WebSocket connector: JSON text frames over `ws://`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl GatewayConnector for WsConnector {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<(MessageSink, MessageStream), TransportError> {
        let uri = endpoint.uri();
        let (ws, _) = tokio_tungstenite::connect_async(uri.as_str()).await?;
        debug!(gateway = %uri, "websocket established");

        let (sink, stream) = ws.split();

        let sink = sink.with(|message: Message| {
            futures::future::ready(
                message
                    .to_json()
                    .map(WsMessage::Text)
                    .map_err(TransportError::from),
            )
        });

        let stream = stream.filter_map(|frame| {
            futures::future::ready(match frame {
                Ok(WsMessage::Text(text)) => {
                    Some(Message::from_json(&text).map_err(TransportError::from))
                }
                Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
                // Binary, ping and pong frames are not part of the protocol.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
