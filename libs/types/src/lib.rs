//! # Actor Runtime Types
//!
//! Shared type system for the actor runtime: the message entity, the
//! lifecycle statuses tracked by the state machine, builtin actor names and
//! the node specs exchanged by the registry.
//!
//! ## Design Philosophy
//!
//! - **Opaque content**: message payloads are bytes; typed handlers encode
//!   their parameters as JSON into them
//! - **Typed statuses**: terminal statuses are their own type so transitions
//!   that require one cannot receive anything else
//! - **One record shape**: the same `ActorMessage` is stored in the WAL; the
//!   wire form is a projection (`WireMessage`)
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{ActorMessage, names};
//!
//! let msg = ActorMessage::new("crawler.scheduler", "crawler.fetch", b"{}".to_vec())
//!     .with_priority(10)
//!     .with_require_ack(true);
//! assert_eq!(names::module_of(&msg.dst), "crawler");
//! ```

pub mod message;
pub mod names;
pub mod node;
pub mod status;

pub use message::{
    generate_message_id, unix_now, ActorMessage, WireMessage, ASK_PRIORITY, DEFAULT_PRIORITY,
};
pub use node::{NetworkSpec, NodeSpec};
pub use status::{MessageStatus, OutboxStatus, TerminalStatus};
