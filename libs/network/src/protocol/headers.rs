//! Request header names and the ask header set

use crate::{Result, TransportError};
use types::ActorMessage;

pub const CONTENT_ENCODING: &str = "actor-content-encoding";
pub const TOKEN: &str = "actor-token";

pub const ASK_ID: &str = "actor-ask-id";
pub const ASK_SRC: &str = "actor-ask-src";
pub const ASK_SRC_NODE: &str = "actor-ask-src-node";
pub const ASK_DST: &str = "actor-ask-dst";
pub const ASK_DST_NODE: &str = "actor-ask-dst-node";
pub const ASK_DST_URL: &str = "actor-ask-dst-url";

/// Metadata of a synchronous request, carried in headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskHeaders {
    pub id: String,
    pub src: String,
    pub src_node: String,
    pub dst: String,
    pub dst_node: Option<String>,
    pub dst_url: Option<String>,
}

impl AskHeaders {
    pub fn from_message(message: &ActorMessage) -> Self {
        Self {
            id: message.id.clone(),
            src: message.src.clone(),
            src_node: message.src_node.clone(),
            dst: message.dst.clone(),
            dst_node: message.dst_node.clone(),
            dst_url: message.dst_url.clone(),
        }
    }

    /// Header name/value pairs, optional ones only when present
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (ASK_ID, self.id.clone()),
            (ASK_SRC, self.src.clone()),
            (ASK_SRC_NODE, self.src_node.clone()),
            (ASK_DST, self.dst.clone()),
        ];
        if let Some(dst_node) = &self.dst_node {
            pairs.push((ASK_DST_NODE, dst_node.clone()));
        }
        if let Some(dst_url) = &self.dst_url {
            pairs.push((ASK_DST_URL, dst_url.clone()));
        }
        pairs
    }

    /// Read the ask headers through `get`. `Ok(None)` means a batch request.
    pub fn parse<'a, F>(get: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let Some(dst) = get(ASK_DST) else {
            return Ok(None);
        };
        let required = |name: &str| {
            get(name)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| TransportError::protocol(format!("missing header {}", name)))
        };
        Ok(Some(Self {
            id: required(ASK_ID)?,
            src: required(ASK_SRC)?,
            src_node: get(ASK_SRC_NODE).unwrap_or_default().to_string(),
            dst: dst.to_string(),
            dst_node: get(ASK_DST_NODE).map(|v| v.to_string()),
            dst_url: get(ASK_DST_URL).map(|v| v.to_string()),
        }))
    }

    /// Rebuild the ask message around its decoded content
    pub fn into_message(self, content: Vec<u8>) -> ActorMessage {
        let mut message = ActorMessage::new(self.src, self.dst, content)
            .with_id(self.id)
            .with_src_node(self.src_node)
            .into_ask();
        message.dst_node = self.dst_node;
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_pairs_parse_back() {
        let msg = ActorMessage::new("actor.message_fetcher", "actor.message_exporter", vec![])
            .with_id("a1")
            .with_src_node("n1")
            .with_dst_node("n2")
            .into_ask();
        let headers = AskHeaders::from_message(&msg);
        let map: HashMap<&str, String> = headers.pairs().into_iter().collect();
        let parsed = AskHeaders::parse(|name| map.get(name).map(|v| v.as_str()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed, headers);

        let rebuilt = parsed.into_message(b"{}".to_vec());
        assert!(rebuilt.is_ask);
        assert_eq!(rebuilt.dst_node.as_deref(), Some("n2"));
        assert_eq!(rebuilt.src_node, "n1");
    }

    #[test]
    fn test_batch_request_has_no_ask_headers() {
        let parsed = AskHeaders::parse(|_| None).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_incomplete_ask_headers_rejected() {
        let err = AskHeaders::parse(|name| (name == ASK_DST).then_some("a.b")).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }
}
