//! Network Infrastructure
//!
//! Everything a node needs to reach actors on other nodes:
//!
//! - `discovery`: the actor registry, which maps actor modules to nodes and
//!   nodes to the URLs reachable from here
//! - `protocol`: HTTP header names, ask metadata and token checks
//! - `transports`: the HTTP sender and receiver
//!
//! Message bodies are encoded by the `codec` crate; this crate only moves
//! bytes and decides where they go.

pub mod discovery;
pub mod error;
pub mod protocol;
pub mod transports;

pub use discovery::{ActorRegistry, NodeInfo};
pub use error::{Result, TransportError};
pub use protocol::{AskHeaders, TokenVerifier};
pub use transports::{
    HttpReceiver, HttpSender, InboxHandler, MessageSender, SenderQueue, SenderStats, DEFAULT_MAX_BODY_SIZE,
};
