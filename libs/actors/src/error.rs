//! Actor Runtime Error Types
//!
//! `StateError` covers rejected state machine transitions, `StorageError`
//! the write-ahead log, and `ActorError` everything the runtime surfaces to
//! callers. Transition errors are values: the queue logs and skips them,
//! callers that care match on the variant.

use network::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected state machine transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Message id is already active or was recently completed OK
    #[error("Duplicate message {message_id}")]
    Duplicate { message_id: String },

    #[error("Message {message_id} not found")]
    NotFound { message_id: String },

    /// Transition not allowed from the current status
    #[error("Message {message_id} is {actual}, {operation} expects {expected}")]
    InvalidStatus {
        message_id: String,
        operation: &'static str,
        actual: String,
        expected: &'static str,
    },

    /// Malformed transition arguments
    #[error("Invalid transition: {message}")]
    Invalid { message: String },
}

impl StateError {
    pub fn duplicate(message_id: impl Into<String>) -> Self {
        Self::Duplicate {
            message_id: message_id.into(),
        }
    }

    pub fn not_found(message_id: impl Into<String>) -> Self {
        Self::NotFound {
            message_id: message_id.into(),
        }
    }

    pub fn invalid_status(
        message_id: impl Into<String>,
        operation: &'static str,
        actual: impl ToString,
        expected: &'static str,
    ) -> Self {
        Self::InvalidStatus {
            message_id: message_id.into(),
            operation,
            actual: actual.to_string(),
            expected,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            StateError::Duplicate { .. } => "duplicate",
            StateError::NotFound { .. } => "not_found",
            StateError::InvalidStatus { .. } => "invalid_status",
            StateError::Invalid { .. } => "invalid",
        }
    }
}

/// Write-ahead log failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Truncated or corrupt frame, records before `offset` are intact
    #[error("Dirty log {path:?} at offset {offset}: {message}")]
    DirtyLog {
        path: PathBuf,
        offset: u64,
        message: String,
    },

    #[error("Record encode error: {message}")]
    Encode { message: String },

    #[error("Compaction error: {message}")]
    Compaction { message: String },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn dirty(path: impl Into<PathBuf>, offset: u64, message: impl Into<String>) -> Self {
        Self::DirtyLog {
            path: path.into(),
            offset,
            message: message.into(),
        }
    }

    pub fn compaction(message: impl Into<String>) -> Self {
        Self::Compaction {
            message: message.into(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            StorageError::Io { .. } => "io",
            StorageError::DirtyLog { .. } => "dirty_log",
            StorageError::Encode { .. } => "encode",
            StorageError::Compaction { .. } => "compaction",
        }
    }
}

/// Runtime errors surfaced to node, executor and handler callers
#[derive(Error, Debug)]
pub enum ActorError {
    #[error("Actor registration error: {message}")]
    Registration { message: String },

    #[error("Unknown actor {name}")]
    UnknownActor { name: String },

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The handler of an ask failed, the message is the handler error
    #[error("Handler of {actor} failed: {message}")]
    Handler { actor: String, message: String },

    #[error("Content error: {0}")]
    Content(#[from] serde_json::Error),

    #[error("Ask to {dst} timed out after {timeout_ms}ms")]
    Timeout { dst: String, timeout_ms: u64 },

    #[error("Configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("Actor node is shut down")]
    Shutdown,
}

impl ActorError {
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    pub fn unknown_actor(name: impl Into<String>) -> Self {
        Self::UnknownActor { name: name.into() }
    }

    pub fn handler(actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ActorError::Transport(e) => e.is_retryable(),
            ActorError::Timeout { .. } => true,
            ActorError::Storage(StorageError::Io { .. }) => true,
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ActorError::Registration { .. } => "registration",
            ActorError::UnknownActor { .. } => "unknown_actor",
            ActorError::State(e) => e.category(),
            ActorError::Storage(e) => e.category(),
            ActorError::Transport(e) => e.category(),
            ActorError::Handler { .. } => "handler",
            ActorError::Content(_) => "content",
            ActorError::Timeout { .. } => "timeout",
            ActorError::Config(_) => "configuration",
            ActorError::Shutdown => "shutdown",
        }
    }
}

/// Result type alias for actor runtime operations
pub type Result<T> = std::result::Result<T, ActorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = StateError::invalid_status("m1", "execute", "OUTBOX", "INBOX");
        assert_eq!(err.to_string(), "Message m1 is OUTBOX, execute expects INBOX");
        assert_eq!(err.category(), "invalid_status");
    }

    #[test]
    fn test_actor_error_classification() {
        let err: ActorError = StateError::duplicate("m1").into();
        assert_eq!(err.category(), "duplicate");
        assert!(!err.is_retryable());

        let err: ActorError = TransportError::network("reset").into();
        assert!(err.is_retryable());

        let err = ActorError::Timeout {
            dst: "demo.echo".to_string(),
            timeout_ms: 100,
        };
        assert!(err.is_retryable());
    }
}
