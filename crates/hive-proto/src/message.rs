//! The routed message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::endpoint::GatewayEndpoint;
use crate::error::ProtoError;
use crate::types::{ActorId, MessageId};

/// Coarse class of a message, used for handler registration and inbound
/// dispatch. Categories are not demultiplexed onto separate queues; a
/// registered handler for a category takes precedence over the shared
/// inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Liveness probes.
    Ping,
    /// Runtime-internal traffic.
    System,
    /// Application traffic.
    Application,
}

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A request expecting a response.
    Request,
    /// A response correlated to an earlier request.
    Response,
    /// Fire-and-forget.
    OneWay,
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The condition may clear; the caller can retry.
    Transient,
    /// The request cannot succeed; do not retry.
    Unrecoverable,
    /// The gateway shed the request under load.
    GatewayTooBusy,
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Unrecoverable => "unrecoverable",
            Self::GatewayTooBusy => "gateway too busy",
        };
        write!(f, "{s}")
    }
}

/// Rejection payload carried by a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Kind of rejection.
    pub kind: RejectionKind,
    /// Human-readable reason.
    pub reason: String,
}

/// The envelope routed between a client and the actor cluster.
///
/// The body is opaque to the messaging layer; routing looks only at the
/// header fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: MessageId,
    /// Message category.
    pub category: MessageCategory,
    /// Message direction.
    pub direction: Direction,
    /// The actor this message originates from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sending_actor: Option<ActorId>,
    /// The actor this message addresses.
    pub target_actor: ActorId,
    /// Explicit destination gateway; set only for pinned messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_endpoint: Option<GatewayEndpoint>,
    /// Whether this message may be delivered out of order.
    #[serde(default)]
    pub unordered: bool,
    /// For responses, the id of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
    /// Rejection payload, set on rejection responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    /// Send time at the originator.
    pub timestamp: DateTime<Utc>,
    /// Opaque application payload.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Message {
    /// Create an application request addressed to `target`.
    #[must_use]
    pub fn request(target: ActorId) -> Self {
        Self {
            id: MessageId::new(),
            category: MessageCategory::Application,
            direction: Direction::Request,
            sending_actor: None,
            target_actor: target,
            target_endpoint: None,
            unordered: false,
            correlation_id: None,
            rejection: None,
            timestamp: Utc::now(),
            body: serde_json::Value::Null,
        }
    }

    /// Create a one-way application message addressed to `target`.
    #[must_use]
    pub fn one_way(target: ActorId) -> Self {
        Self {
            direction: Direction::OneWay,
            ..Self::request(target)
        }
    }

    /// Create a response answering `request`.
    #[must_use]
    pub fn response_to(request: &Self) -> Self {
        Self {
            id: MessageId::new(),
            category: request.category,
            direction: Direction::Response,
            sending_actor: Some(request.target_actor),
            target_actor: request.sending_actor.unwrap_or(request.target_actor),
            target_endpoint: None,
            unordered: request.unordered,
            correlation_id: Some(request.id),
            rejection: None,
            timestamp: Utc::now(),
            body: serde_json::Value::Null,
        }
    }

    /// Synthesize the rejection response for `request`.
    ///
    /// The optional cause is folded into the reason text. The result flows
    /// back through the normal inbound path so the caller's waiter resolves
    /// the same way a remote rejection would.
    #[must_use]
    pub fn rejection_response(
        request: &Self,
        kind: RejectionKind,
        reason: impl Into<String>,
        cause: Option<&dyn std::error::Error>,
    ) -> Self {
        let mut reason = reason.into();
        if let Some(cause) = cause {
            reason = format!("{reason}: {cause}");
        }
        Self {
            rejection: Some(Rejection { kind, reason }),
            ..Self::response_to(request)
        }
    }

    /// Set the sending actor.
    #[must_use]
    pub fn from_actor(mut self, sender: ActorId) -> Self {
        self.sending_actor = Some(sender);
        self
    }

    /// Pin this message to an explicit destination gateway.
    #[must_use]
    pub fn pinned_to(mut self, endpoint: GatewayEndpoint) -> Self {
        self.target_endpoint = Some(endpoint);
        self
    }

    /// Allow out-of-order delivery.
    #[must_use]
    pub fn into_unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    /// Set the message category.
    #[must_use]
    pub fn with_category(mut self, category: MessageCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the application payload.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Whether this message is a rejection response.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        self.rejection.is_some()
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}
