//! Wire Protocol
//!
//! Header names shared by the sender and the receiver, plus request
//! authentication.
//!
//! A batch request carries only `actor-content-encoding` (and the token).
//! An ask request additionally carries the `actor-ask-*` headers describing
//! the single message whose encoded content is the body.

pub mod headers;
pub mod security;

pub use headers::AskHeaders;
pub use security::TokenVerifier;
