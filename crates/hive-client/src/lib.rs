//! # hive-client
//!
//! The client-side message center of the hive actor runtime: multiplexes
//! a client's outbound requests across a dynamically-changing set of
//! gateway endpoints and surfaces gateway-originated messages to the
//! upper layers.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      MessageCenter                          │
//! │                                                             │
//! │  send ──▶ bucket table ──┐        ┌──▶ inbound queue ──▶ … │
//! │           round robin    │        │        ▲                │
//! │           pinned target  ▼        │   handlers              │
//! │              ┌──────────────────┐ │                         │
//! │              │ ConnectionManager│─┘                         │
//! │              └──────────────────┘                           │
//! │                │ at most one connection per gateway         │
//! │                ▼                                            │
//! │        GatewayConnection × N  ◀── GatewayManager (live set) │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Three selection rules, in priority order:
//!
//! 1. **Pinned target** — a message naming its destination endpoint goes
//!    there, or is rejected if the gateway cannot be reached.
//! 2. **Round robin** — system-target and unordered traffic spreads
//!    across every live gateway.
//! 3. **Sticky bucket** — ordered requests hash their target actor into a
//!    fixed-size table of weak connection references, so all requests to
//!    one actor traverse one gateway while that gateway lives.
//!
//! Connections are pooled per endpoint with at most one in-flight dial
//! per endpoint and a fail-fast cooldown after dial failures.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buckets;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod message_center;
pub mod status;
pub mod transport;

pub use buckets::BucketTable;
pub use config::MessagingConfig;
pub use connection::{GatewayConnection, InboundSink};
pub use connection_manager::ConnectionManager;
pub use error::ClientError;
pub use message_center::{CenterState, MessageCenter, MessageHandler};
pub use status::{ConnectionStatusListener, GatewayCountObserver, NoopStatusListener};
pub use transport::{GatewayConnector, MessageSink, MessageStream, TransportError, WsConnector};
