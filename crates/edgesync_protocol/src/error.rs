//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol encoding and decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR serialization failed.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Bytes could not be parsed as CBOR.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// A required field is absent or has the wrong CBOR type.
    #[error("{context}: missing or invalid field `{field}`")]
    MissingField {
        /// Structure being decoded.
        context: &'static str,
        /// Field name.
        field: String,
    },

    /// A numeric code does not map to a known variant.
    #[error("{context}: unknown code {code} for `{field}`")]
    UnknownCode {
        /// Structure being decoded.
        context: &'static str,
        /// Field name.
        field: String,
        /// The offending code.
        code: u64,
    },

    /// The value decoded but does not form a valid structure.
    #[error("{context}: {message}")]
    InvalidStructure {
        /// Structure being decoded.
        context: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// A frame with no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame type byte is not a known message type.
    #[error("unknown message type code {0}")]
    UnknownMessageType(u8),
}

impl ProtocolError {
    /// Creates a missing field error.
    pub fn missing(context: &'static str, field: impl Into<String>) -> Self {
        Self::MissingField {
            context,
            field: field.into(),
        }
    }

    /// Creates an invalid structure error.
    pub fn invalid(context: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            context,
            message: message.into(),
        }
    }
}
