//! Builtin Message Contents
//!
//! JSON contents exchanged between the builtin actors, locally and across
//! nodes. User actors define their own parameter types the same way.

use serde::{Deserialize, Serialize};
use types::{NodeSpec, TerminalStatus, WireMessage};

/// Ask `actor.message_fetcher` to pull messages for `actor_name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub actor_name: String,
    pub upstream_list: Vec<String>,
    pub max_count: usize,
}

/// Ask `actor.message_exporter` on an upstream node for queued children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub dst: String,
    pub max_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub messages: Vec<WireMessage>,
}

/// Outcome carried by an ack message, the message id is the acked child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckContent {
    pub status: TerminalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DstInfo {
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DstNodeInfo {
    pub dst: String,
    pub dst_node: String,
}

/// Outboxes with pending children, for `actor.message_notify_sender`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// Unpinned children, any node hosting `dst` may take them
    pub dst_info: Vec<DstInfo>,
    /// Children pinned to one node
    pub dst_node_info: Vec<DstNodeInfo>,
}

impl NotifyRequest {
    pub fn is_empty(&self) -> bool {
        self.dst_info.is_empty() && self.dst_node_info.is_empty()
    }
}

/// Announcement received by `actor.message_notify_receiver`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyReceive {
    pub dst_list: Vec<String>,
}

/// Replace the registry contents, for `actor.update_registry`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRegistry {
    pub nodes: Vec<NodeSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_content_json() {
        let ack = AckContent {
            status: TerminalStatus::ErrorNotry,
        };
        let json = serde_json::to_string(&ack).unwrap();
        let back: AckContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ack);
    }

    #[test]
    fn test_notify_request_shape() {
        let request: NotifyRequest = serde_json::from_value(serde_json::json!({
            "dst_info": [{"dst": "crawler.fetch"}],
            "dst_node_info": [{"dst": "actor.message_acker", "dst_node": "worker-1"}],
        }))
        .unwrap();
        assert!(!request.is_empty());
        assert_eq!(request.dst_node_info[0].dst_node, "worker-1");
        assert!(NotifyRequest::default().is_empty());
    }
}
