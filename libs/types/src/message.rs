//! Actor Message
//!
//! One unit of work addressed to an actor by name. The full record is what
//! the write-ahead log stores; `WireMessage` is the projection sent between
//! nodes, which leaves out the fields that only make sense locally
//! (`is_ask`, `is_local`, `parent_id`).
//!
//! Content is opaque bytes. Human readable encoders (JSON) carry it as a
//! base64 string, binary encoders carry the raw bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Priority given to messages that do not ask for one
pub const DEFAULT_PRIORITY: u32 = 100;

/// Asks always run ahead of everything else
pub const ASK_PRIORITY: u32 = 0;

/// Current wall clock as fractional unix seconds
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Generate a fresh message id
pub fn generate_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Message record, WAL form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorMessage {
    pub id: String,
    #[serde(with = "content_bytes")]
    pub content: Vec<u8>,
    pub priority: u32,
    pub src: String,
    pub src_node: String,
    pub dst: String,
    pub dst_node: Option<String>,
    pub is_ask: bool,
    pub require_ack: bool,
    pub expire_at: Option<f64>,
    pub parent_id: Option<String>,
    pub is_local: bool,
    /// Resolved by the registry right before sending, never persisted
    #[serde(skip)]
    pub dst_url: Option<String>,
}

/// Message record, wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub priority: u32,
    pub require_ack: bool,
    pub src: String,
    pub src_node: String,
    pub dst: String,
    pub dst_node: Option<String>,
    pub expire_at: Option<f64>,
    #[serde(with = "content_bytes")]
    pub content: Vec<u8>,
}

impl ActorMessage {
    /// Create a fire-and-forget message. Id and `src_node` stay blank until
    /// the registry completes the message.
    pub fn new(src: impl Into<String>, dst: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: String::new(),
            content,
            priority: DEFAULT_PRIORITY,
            src: src.into(),
            src_node: String::new(),
            dst: dst.into(),
            dst_node: None,
            is_ask: false,
            require_ack: false,
            expire_at: None,
            parent_id: None,
            is_local: false,
            dst_url: None,
        }
    }

    /// Create a message whose content is the JSON encoding of `content`
    pub fn with_json<T: Serialize>(
        src: impl Into<String>,
        dst: impl Into<String>,
        content: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(src, dst, serde_json::to_vec(content)?))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        if !self.is_ask {
            self.priority = priority;
        }
        self
    }

    pub fn with_dst_node(mut self, dst_node: impl Into<String>) -> Self {
        self.dst_node = Some(dst_node.into());
        self
    }

    pub fn with_src_node(mut self, src_node: impl Into<String>) -> Self {
        self.src_node = src_node.into();
        self
    }

    pub fn with_require_ack(mut self, require_ack: bool) -> Self {
        if !self.is_ask {
            self.require_ack = require_ack;
        }
        self
    }

    pub fn with_expire_at(mut self, expire_at: f64) -> Self {
        if !self.is_ask {
            self.expire_at = Some(expire_at);
        }
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Turn into a synchronous request: highest priority, no ack, no expiry
    pub fn into_ask(mut self) -> Self {
        self.is_ask = true;
        self.priority = ASK_PRIORITY;
        self.require_ack = false;
        self.expire_at = None;
        self
    }

    pub fn is_expired(&self, now: f64) -> bool {
        matches!(self.expire_at, Some(expire_at) if expire_at <= now)
    }

    /// Copy without content, kept for bookkeeping once content is consumed
    pub fn meta(&self) -> Self {
        Self {
            content: Vec::new(),
            ..self.clone()
        }
    }

    /// Decode the content as JSON. Empty content decodes as `null`.
    pub fn decode_content<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        if self.content.is_empty() {
            serde_json::from_slice(b"null")
        } else {
            serde_json::from_slice(&self.content)
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id.clone(),
            priority: self.priority,
            require_ack: self.require_ack,
            src: self.src.clone(),
            src_node: self.src_node.clone(),
            dst: self.dst.clone(),
            dst_node: self.dst_node.clone(),
            expire_at: self.expire_at,
            content: self.content.clone(),
        }
    }
}

impl From<WireMessage> for ActorMessage {
    fn from(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            content: wire.content,
            priority: wire.priority,
            src: wire.src,
            src_node: wire.src_node,
            dst: wire.dst,
            dst_node: wire.dst_node,
            is_ask: false,
            require_ack: wire.require_ack,
            expire_at: wire.expire_at,
            parent_id: None,
            is_local: false,
            dst_url: None,
        }
    }
}

/// Serde adapter for opaque content bytes
pub mod content_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(Base64Visitor)
        } else {
            deserializer.deserialize_byte_buf(RawVisitor)
        }
    }

    struct Base64Visitor;

    impl<'de> Visitor<'de> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("base64 encoded content")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Vec<u8>, E> {
            STANDARD.decode(value).map_err(E::custom)
        }
    }

    struct RawVisitor;

    impl<'de> Visitor<'de> for RawVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("content bytes")
        }

        fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Vec<u8>, E> {
            Ok(value.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(value)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                bytes.push(b);
            }
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_invariants() {
        let msg = ActorMessage::new("a.x", "b.y", Vec::new())
            .with_priority(7)
            .with_require_ack(true)
            .with_expire_at(10.0)
            .into_ask();
        assert!(msg.is_ask);
        assert_eq!(msg.priority, ASK_PRIORITY);
        assert!(!msg.require_ack);
        assert_eq!(msg.expire_at, None);

        // builders cannot undo the ask invariants afterwards
        let msg = msg.with_priority(50).with_require_ack(true).with_expire_at(1.0);
        assert_eq!(msg.priority, ASK_PRIORITY);
        assert!(!msg.require_ack);
        assert_eq!(msg.expire_at, None);
    }

    #[test]
    fn test_expiry() {
        let msg = ActorMessage::new("a.x", "b.y", Vec::new());
        assert!(!msg.is_expired(f64::MAX));
        let msg = msg.with_expire_at(100.0);
        assert!(!msg.is_expired(99.9));
        assert!(msg.is_expired(100.0));
    }

    #[test]
    fn test_json_content_is_base64() {
        let msg = ActorMessage::new("a.x", "b.y", vec![0, 159, 255]).with_id("m1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "AJ//");
        let decoded: ActorMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.content, vec![0, 159, 255]);
    }

    #[test]
    fn test_binary_content_is_raw() {
        let msg = ActorMessage::new("a.x", "b.y", b"hello".to_vec())
            .with_id("m1")
            .with_parent("p1");
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ActorMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_projection_drops_local_fields() {
        let mut msg = ActorMessage::new("a.x", "b.y", b"{}".to_vec())
            .with_id("m1")
            .with_parent("p1");
        msg.is_local = true;
        let back = ActorMessage::from(msg.to_wire());
        assert_eq!(back.id, "m1");
        assert_eq!(back.parent_id, None);
        assert!(!back.is_local);
        assert_eq!(back.content, msg.content);
    }

    #[test]
    fn test_decode_empty_content_as_null() {
        let msg = ActorMessage::new("a.x", "b.y", Vec::new());
        let value: Option<u32> = msg.decode_content().unwrap();
        assert_eq!(value, None);
        msg.decode_content::<()>().unwrap();
    }

    #[test]
    fn test_meta_drops_content() {
        let msg = ActorMessage::new("a.x", "b.y", b"payload".to_vec()).with_id("m1");
        let meta = msg.meta();
        assert!(meta.content.is_empty());
        assert_eq!(meta.id, "m1");
    }
}
