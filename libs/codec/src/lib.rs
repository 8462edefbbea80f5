//! # Actor Message Codec
//!
//! Encoding rules for actor message content and message batches on the wire.
//!
//! ## Supported codecs
//!
//! | token         | format                      |
//! |---------------|-----------------------------|
//! | `json`        | JSON, content as base64     |
//! | `binary`      | bincode, content as bytes   |
//! | `json+gzip`   | gzip wrapped JSON           |
//! | `binary+gzip` | gzip wrapped bincode        |
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → network/ (sender, receiver)
//! ```

pub mod encoding;
pub mod error;

pub use encoding::{
    batch_decode, batch_encode, decode, decode_payload, encode, encode_payload, ContentEncoding,
};
pub use error::{CodecError, Result};
