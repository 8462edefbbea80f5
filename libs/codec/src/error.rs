//! Codec errors for actor message encoding
//!
//! Every failure names the codec it came from so a rejected request can be
//! traced back to the `actor-content-encoding` header that selected it.

use thiserror::Error;

/// Encoding and decoding failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// The codec token is not one of json, binary, json+gzip, binary+gzip
    #[error("Unsupported codec: {token:?}")]
    UnsupportedCodec { token: String },

    /// Value could not be serialized
    #[error("Encode error ({codec}): {message}")]
    Encode { codec: String, message: String },

    /// Payload is malformed for the selected codec
    #[error("Decode error ({codec}): {message}")]
    Decode { codec: String, message: String },
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Create an unsupported codec error
    pub fn unsupported(token: impl Into<String>) -> Self {
        Self::UnsupportedCodec {
            token: token.into(),
        }
    }

    /// Create an encode error
    pub fn encode(codec: impl Into<String>, message: impl ToString) -> Self {
        Self::Encode {
            codec: codec.into(),
            message: message.to_string(),
        }
    }

    /// Create a decode error
    pub fn decode(codec: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            codec: codec.into(),
            message: message.to_string(),
        }
    }

    /// Get error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            CodecError::UnsupportedCodec { .. } => "unsupported_codec",
            CodecError::Encode { .. } => "encode",
            CodecError::Decode { .. } => "decode",
        }
    }
}
