//! # hive-proto
//!
//! Protocol definitions for hive client-gateway messaging.
//!
//! This crate provides the data model shared by the client message center
//! and the gateways it talks to:
//!
//! - [`ActorId`] — addressable actor identities with a stable routing hash
//! - [`GatewayEndpoint`] / [`GatewayUri`] — gateway addressing
//! - [`Message`] — the routed envelope, including rejection responses
//!
//! Messages travel as JSON text frames; [`Message::to_json`] and
//! [`Message::from_json`] are the wire encoding.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod endpoint;
pub mod error;
pub mod message;
pub mod types;

pub use endpoint::{GatewayEndpoint, GatewayUri};
pub use error::ProtoError;
pub use message::{Direction, Message, MessageCategory, Rejection, RejectionKind};
pub use types::{ActorId, ActorKind, MessageId};
