//! Actor and message identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ProtoError;

/// FNV-1a 32-bit offset basis.
const FNV_OFFSET: u32 = 0x811c_9dc5;
/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 0x0100_0193;

/// The kind of an actor identity.
///
/// The kind participates in routing (system targets bypass the sticky
/// bucket table) and in client-identity transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// A hosted actor addressed through the cluster.
    Grain,
    /// A connected client.
    Client,
    /// A client participating in geo-distributed routing.
    GeoClient,
    /// A runtime-internal system target.
    System,
}

impl ActorKind {
    /// Stable single-byte tag mixed into the routing hash.
    const fn tag(self) -> u8 {
        match self {
            Self::Grain => 0,
            Self::Client => 1,
            Self::GeoClient => 2,
            Self::System => 3,
        }
    }
}

/// Unique identifier for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    kind: ActorKind,
    id: Uuid,
}

impl ActorId {
    /// Create a new actor identity of the given kind.
    #[must_use]
    pub fn new(kind: ActorKind) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }

    /// Create a grain identity.
    #[must_use]
    pub fn grain() -> Self {
        Self::new(ActorKind::Grain)
    }

    /// Create a client identity.
    #[must_use]
    pub fn client() -> Self {
        Self::new(ActorKind::Client)
    }

    /// Create a system-target identity.
    #[must_use]
    pub fn system_target() -> Self {
        Self::new(ActorKind::System)
    }

    /// Rebuild an identity from its parts.
    #[must_use]
    pub const fn from_parts(kind: ActorKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    /// Parse an actor identity from `<kind>/<uuid>` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind or UUID component is malformed.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| ProtoError::Validation(format!("invalid actor id: {s}")))?;
        let kind = match kind {
            "grain" => ActorKind::Grain,
            "client" => ActorKind::Client,
            "geo_client" => ActorKind::GeoClient,
            "system" => ActorKind::System,
            other => {
                return Err(ProtoError::Validation(format!("invalid actor kind: {other}")));
            }
        };
        let id = Uuid::parse_str(id)
            .map_err(|e| ProtoError::Validation(format!("invalid actor id: {e}")))?;
        Ok(Self { kind, id })
    }

    /// The kind of this identity.
    #[must_use]
    pub const fn kind(&self) -> ActorKind {
        self.kind
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.id
    }

    /// Whether this identity addresses a runtime-internal system target.
    #[must_use]
    pub fn is_system_target(&self) -> bool {
        self.kind == ActorKind::System
    }

    /// Derive the same identity with a different kind.
    ///
    /// Used by the message center's client-identity transition; the UUID
    /// component is preserved.
    #[must_use]
    pub const fn with_kind(self, kind: ActorKind) -> Self {
        Self { kind, id: self.id }
    }

    /// Stable 32-bit routing hash of this identity.
    ///
    /// FNV-1a over the kind tag followed by the raw UUID bytes. The result
    /// selects the sender bucket for ordered requests and therefore must
    /// never change across releases; see the fixed vectors in the tests.
    #[must_use]
    pub fn stable_hash(&self) -> u32 {
        let mut hash = FNV_OFFSET;
        hash ^= u32::from(self.kind.tag());
        hash = hash.wrapping_mul(FNV_PRIME);
        for byte in self.id.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ActorKind::Grain => "grain",
            ActorKind::Client => "client",
            ActorKind::GeoClient => "geo_client",
            ActorKind::System => "system",
        };
        write!(f, "{kind}/{}", self.id)
    }
}

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random `MessageId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
