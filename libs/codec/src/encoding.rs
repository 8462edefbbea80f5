//! Content Encoding
//!
//! Encodes single payloads and message batches for the HTTP transport. The
//! codec is selected per request by the `actor-content-encoding` header:
//! `json`, `binary` (bincode), or either one wrapped in gzip.

use crate::{CodecError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use types::{ActorMessage, WireMessage};

/// Upper bound for a decompressed body, guards against gzip bombs
pub const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

/// Codec token carried in `actor-content-encoding`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentEncoding {
    #[default]
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "json+gzip")]
    JsonGzip,
    #[serde(rename = "binary+gzip")]
    BinaryGzip,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Json => "json",
            ContentEncoding::Binary => "binary",
            ContentEncoding::JsonGzip => "json+gzip",
            ContentEncoding::BinaryGzip => "binary+gzip",
        }
    }

    /// Parse an optional header value, a missing header means json
    pub fn from_header(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(ContentEncoding::Json),
            Some(token) => token.parse(),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ContentEncoding::Json | ContentEncoding::JsonGzip)
    }

    pub fn is_gzip(&self) -> bool {
        matches!(self, ContentEncoding::JsonGzip | ContentEncoding::BinaryGzip)
    }
}

impl FromStr for ContentEncoding {
    type Err = CodecError;

    fn from_str(token: &str) -> Result<Self> {
        match token.trim() {
            "json" => Ok(ContentEncoding::Json),
            "binary" => Ok(ContentEncoding::Binary),
            "json+gzip" => Ok(ContentEncoding::JsonGzip),
            "binary+gzip" => Ok(ContentEncoding::BinaryGzip),
            other => Err(CodecError::unsupported(other)),
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a value with the given codec
pub fn encode<T: Serialize + ?Sized>(value: &T, codec: ContentEncoding) -> Result<Vec<u8>> {
    let raw = if codec.is_json() {
        serde_json::to_vec(value).map_err(|e| CodecError::encode(codec.as_str(), e))?
    } else {
        bincode::serialize(value).map_err(|e| CodecError::encode(codec.as_str(), e))?
    };
    if codec.is_gzip() {
        gzip(&raw, codec)
    } else {
        Ok(raw)
    }
}

/// Decode a value with the given codec
pub fn decode<T: DeserializeOwned>(data: &[u8], codec: ContentEncoding) -> Result<T> {
    let unzipped;
    let raw = if codec.is_gzip() {
        unzipped = gunzip(data, codec)?;
        &unzipped[..]
    } else {
        data
    };
    if codec.is_json() {
        serde_json::from_slice(raw).map_err(|e| CodecError::decode(codec.as_str(), e))
    } else {
        bincode::deserialize(raw).map_err(|e| CodecError::decode(codec.as_str(), e))
    }
}

/// Encode a batch of messages in wire form
pub fn batch_encode(messages: &[ActorMessage], codec: ContentEncoding) -> Result<Vec<u8>> {
    let wire: Vec<WireMessage> = messages.iter().map(ActorMessage::to_wire).collect();
    encode(&wire, codec)
}

/// Decode a batch of wire form messages
pub fn batch_decode(data: &[u8], codec: ContentEncoding) -> Result<Vec<ActorMessage>> {
    let wire: Vec<WireMessage> = decode(data, codec)?;
    Ok(wire.into_iter().map(ActorMessage::from).collect())
}

#[derive(Serialize, Deserialize)]
struct Payload(#[serde(with = "types::message::content_bytes")] Vec<u8>);

/// Encode the opaque content of a single message (ask request or reply)
pub fn encode_payload(content: &[u8], codec: ContentEncoding) -> Result<Vec<u8>> {
    encode(&Payload(content.to_vec()), codec)
}

/// Decode the opaque content of a single message
pub fn decode_payload(data: &[u8], codec: ContentEncoding) -> Result<Vec<u8>> {
    let payload: Payload = decode(data, codec)?;
    Ok(payload.0)
}

fn gzip(data: &[u8], codec: ContentEncoding) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::encode(codec.as_str(), format!("gzip failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| CodecError::encode(codec.as_str(), format!("gzip failed: {}", e)))
}

fn gunzip(data: &[u8], codec: ContentEncoding) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::decode(codec.as_str(), format!("gunzip failed: {}", e)))?;
    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(CodecError::decode(
            codec.as_str(),
            format!("decompressed body exceeds {} bytes", MAX_DECOMPRESSED_SIZE),
        ));
    }
    Ok(out)
}
