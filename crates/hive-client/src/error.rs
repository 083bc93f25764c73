//! Error types for the client message center.

use hive_proto::GatewayEndpoint;
use thiserror::Error;

/// Errors surfaced by the message center and its connection pool.
///
/// Not every failure mode has a variant here: a send that loses the race
/// with a closing connection is retried or rejected in place, and
/// operations against a stopped center drop their message with a log
/// line rather than returning an error to a caller that is not waiting.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The live-gateway set was empty at selection time.
    #[error("No gateways available")]
    NoGatewaysAvailable,

    /// A dial failed, or the endpoint is inside its failure cooldown.
    #[error("connection to gateway {endpoint} failed: {reason}")]
    ConnectionFailed {
        /// The endpoint that could not be reached.
        endpoint: GatewayEndpoint,
        /// Underlying cause or cooldown notice.
        reason: String,
    },

    /// The connection was closed by an abort or by manager shutdown.
    #[error("connection to gateway {endpoint} aborted: {reason}")]
    ConnectionAborted {
        /// The endpoint the aborted connection belonged to.
        endpoint: GatewayEndpoint,
        /// Why the connection was aborted.
        reason: String,
    },

    /// A lifecycle or identity transition was not permitted.
    #[error("invalid state: {0}")]
    InvalidState(String),
}
