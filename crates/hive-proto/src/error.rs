//! Error types for the protocol crate.

use thiserror::Error;

/// Errors that can occur when encoding, decoding, or validating
/// protocol data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a value for the wire.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Failed to decode a value from the wire.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}
