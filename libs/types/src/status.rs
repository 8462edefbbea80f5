//! Message lifecycle statuses
//!
//! `MessageStatus` is the status of an inbox message, `OutboxStatus` the
//! status of a child message spawned while handling it. Both share the
//! terminal subset `TerminalStatus`, which is what `done`, `complete` and
//! `acked` transitions accept.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of a message or of a child delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Ok,
    /// Failed, may be retried
    Error,
    /// Failed permanently
    ErrorNotry,
}

/// Status of a message owned by the local inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Inbox,
    Executing,
    Outbox,
    Ok,
    Error,
    ErrorNotry,
}

/// Status of a child message waiting for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Outbox,
    Exported,
    Ok,
    Error,
    ErrorNotry,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Ok => "OK",
            TerminalStatus::Error => "ERROR",
            TerminalStatus::ErrorNotry => "ERROR_NOTRY",
        }
    }
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Inbox => "INBOX",
            MessageStatus::Executing => "EXECUTING",
            MessageStatus::Outbox => "OUTBOX",
            MessageStatus::Ok => "OK",
            MessageStatus::Error => "ERROR",
            MessageStatus::ErrorNotry => "ERROR_NOTRY",
        }
    }

    /// Terminal part of the status, if the message has finished executing
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            MessageStatus::Ok => Some(TerminalStatus::Ok),
            MessageStatus::Error => Some(TerminalStatus::Error),
            MessageStatus::ErrorNotry => Some(TerminalStatus::ErrorNotry),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal().is_some()
    }

    /// Failed messages may be delivered again under the same id
    pub fn is_error(&self) -> bool {
        matches!(self, MessageStatus::Error | MessageStatus::ErrorNotry)
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Outbox => "OUTBOX",
            OutboxStatus::Exported => "EXPORTED",
            OutboxStatus::Ok => "OK",
            OutboxStatus::Error => "ERROR",
            OutboxStatus::ErrorNotry => "ERROR_NOTRY",
        }
    }

    /// A child is resolved once it can no longer change on its own
    pub fn is_resolved(&self) -> bool {
        matches!(self, OutboxStatus::Ok | OutboxStatus::ErrorNotry)
    }
}

impl From<TerminalStatus> for MessageStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Ok => MessageStatus::Ok,
            TerminalStatus::Error => MessageStatus::Error,
            TerminalStatus::ErrorNotry => MessageStatus::ErrorNotry,
        }
    }
}

impl From<TerminalStatus> for OutboxStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Ok => OutboxStatus::Ok,
            TerminalStatus::Error => OutboxStatus::Error,
            TerminalStatus::ErrorNotry => OutboxStatus::ErrorNotry,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TerminalStatus::ErrorNotry).unwrap();
        assert_eq!(json, "\"ERROR_NOTRY\"");
        let status: MessageStatus = serde_json::from_str("\"EXECUTING\"").unwrap();
        assert_eq!(status, MessageStatus::Executing);
    }

    #[test]
    fn test_terminal_projection() {
        assert_eq!(MessageStatus::Ok.terminal(), Some(TerminalStatus::Ok));
        assert_eq!(MessageStatus::Outbox.terminal(), None);
        assert!(MessageStatus::ErrorNotry.is_error());
        assert!(!MessageStatus::Inbox.is_error());
        assert!(OutboxStatus::ErrorNotry.is_resolved());
        assert!(!OutboxStatus::Error.is_resolved());
    }
}
