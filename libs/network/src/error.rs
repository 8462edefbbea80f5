//! Transport Error Types
//!
//! Failures of the HTTP transport: outbound requests, node resolution and
//! validation of inbound requests. The receiver maps them onto HTTP status
//! codes, the sender onto retry decisions.

use codec::CodecError;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Request could not be sent or the client could not be built
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Connection to {url:?} failed: {message}")]
    Connection {
        message: String,
        url: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Missing or malformed request headers
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Codec error: {source}")]
    Codec { source: CodecError },

    /// Token missing or rejected
    #[error("Security error: {message}")]
    Security { message: String },

    /// Request body over the receiver's limit
    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// No node hosts the actor, or the node has no reachable URL
    #[error("Topology error: {message}")]
    Topology { message: String },

    /// Non-success status from the remote node
    #[error("Remote node answered HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Local transport machinery stopped or failed to start
    #[error("System error: {message}")]
    System { message: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::PayloadTooLarge { limit }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology {
            message: message.into(),
        }
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Whether resending the same request later may succeed.
    /// Remote 5xx answers count, 4xx answers do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::Io { .. }
            | Self::System { .. } => true,
            Self::Remote { status, .. } => *status >= 500,
            Self::Protocol { .. }
            | Self::Codec { .. }
            | Self::Security { .. }
            | Self::PayloadTooLarge { .. }
            | Self::Topology { .. } => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Connection { .. } => "connection",
            Self::Protocol { .. } => "protocol",
            Self::Codec { .. } => "codec",
            Self::Security { .. } => "security",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Timeout { .. } => "timeout",
            Self::Topology { .. } => "topology",
            Self::Remote { .. } => "remote",
            Self::Io { .. } => "io",
            Self::System { .. } => "system",
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(source: CodecError) -> Self {
        Self::Codec { source }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        let url = error.url().map(|u| u.to_string());
        if error.is_timeout() {
            Self::timeout(format!("request to {}", url.unwrap_or_default()), 0)
        } else if error.is_connect() {
            Self::Connection {
                message: "connect failed".to_string(),
                url,
                source: Some(Box::new(error)),
            }
        } else if let Some(status) = error.status() {
            Self::remote(status.as_u16(), error.to_string())
        } else {
            Self::network_with_source("HTTP request failed", error)
        }
    }
}

impl From<hyper::Error> for TransportError {
    fn from(error: hyper::Error) -> Self {
        Self::network_with_source("HTTP server error", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::network("reset").is_retryable());
        assert!(TransportError::remote(503, "busy").is_retryable());
        assert!(!TransportError::remote(400, "bad request").is_retryable());
        assert!(!TransportError::security("bad token").is_retryable());
        assert!(TransportError::timeout("ask", 30_000).is_retryable());
        assert!(!TransportError::topology("no node").is_retryable());
        assert!(!TransportError::payload_too_large(1024).is_retryable());
    }

    #[test]
    fn test_codec_conversion() {
        let err: TransportError = CodecError::unsupported("xml").into();
        assert_eq!(err.category(), "codec");
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn test_io_conversion() {
        let err: TransportError = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy").into();
        assert_eq!(err.category(), "io");
    }
}
