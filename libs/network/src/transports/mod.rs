//! HTTP Transport
//!
//! Nodes talk to each other over plain HTTP: `sender` posts batches and
//! asks to remote nodes, `receiver` serves the local inbox endpoint.

pub mod receiver;
pub mod sender;

pub use receiver::{HttpReceiver, InboxHandler, DEFAULT_MAX_BODY_SIZE};
pub use sender::{HttpSender, MessageSender, SenderQueue, SenderMetrics, SenderStats, MAX_BATCH_SIZE};
