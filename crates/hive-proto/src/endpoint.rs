//! Gateway addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::error::ProtoError;

/// The address of one gateway.
///
/// The generation distinguishes successive incarnations of a gateway on
/// the same socket address; two endpoints are equal only if the address
/// and the generation both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayEndpoint {
    /// Socket address of the gateway listener.
    pub addr: SocketAddr,
    /// Incarnation number of the gateway process.
    pub generation: i32,
}

impl GatewayEndpoint {
    /// Create an endpoint for the given address and generation.
    #[must_use]
    pub const fn new(addr: SocketAddr, generation: i32) -> Self {
        Self { addr, generation }
    }

    /// Parse an endpoint from `<addr>@<generation>` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or generation is malformed.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let (addr, generation) = s
            .split_once('@')
            .ok_or_else(|| ProtoError::Validation(format!("invalid endpoint: {s}")))?;
        let addr = addr
            .parse()
            .map_err(|e| ProtoError::Validation(format!("invalid endpoint address: {e}")))?;
        let generation = generation
            .parse()
            .map_err(|e| ProtoError::Validation(format!("invalid endpoint generation: {e}")))?;
        Ok(Self { addr, generation })
    }

    /// The gateway URI this endpoint is reachable under.
    ///
    /// The generation is not part of the URI: every incarnation of a
    /// gateway listens on the same address, and the gateway list is keyed
    /// by where to dial, not by which incarnation answers.
    #[must_use]
    pub fn uri(&self) -> GatewayUri {
        GatewayUri(format!("ws://{}", self.addr))
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.generation)
    }
}

/// A dialable gateway URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayUri(String);

impl GatewayUri {
    /// Wrap a raw URI string.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The URI as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dialable endpoint behind this URI.
    ///
    /// The generation of a gateway is only learned after connecting, so
    /// the endpoint derived from a URI carries generation 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI does not carry a `ws://` or `wss://`
    /// socket address.
    pub fn to_endpoint(&self) -> Result<GatewayEndpoint, ProtoError> {
        let rest = self
            .0
            .strip_prefix("ws://")
            .or_else(|| self.0.strip_prefix("wss://"))
            .ok_or_else(|| ProtoError::Validation(format!("invalid gateway uri: {}", self.0)))?;
        let addr = rest
            .trim_end_matches('/')
            .parse()
            .map_err(|e| ProtoError::Validation(format!("invalid gateway uri: {e}")))?;
        Ok(GatewayEndpoint::new(addr, 0))
    }
}

impl fmt::Display for GatewayUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
