//! Actor Runtime with Durable Mailboxes
//!
//! Named actors exchange messages inside a node and across nodes with
//! at-least-once delivery, ordered retry and crash recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── ActorNode ─────────────────────────┐
//! │                                                            │
//! │  ActorTable ──> Executor ──┬── blocking workers (threads)  │
//! │                    │       └── cooperative workers (tokio) │
//! │                    ▼                                       │
//! │          ActorMessageQueue  (inbox / outbox heaps)         │
//! │                    │                                       │
//! │             DurableState = ActorState + WAL                │
//! │                                                            │
//! │  HttpReceiver ──> NodeInbox          MessageSender ──> HTTP│
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Children told by a handler wait in the outbox of their parent until the
//! node hosting the destination fetches them; the final status travels back
//! as an ack. See [`builtin`] for the protocol.
//!
//! # Example
//!
//! ```rust,no_run
//! use actor_config::NodeConfig;
//! use messaging_actors::{Actor, ActorContext, ActorNode};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let echo = Actor::blocking("demo.echo", |_ctx: &ActorContext, text: String| Ok(text));
//! let node = ActorNode::new(NodeConfig::default(), vec![echo])?;
//! node.start().await?;
//!
//! let reply: String = node.ask("demo.echo", &"hello").await?;
//! assert_eq!(reply, "hello");
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod context;
pub mod error;
pub mod executor;
pub mod health;
pub mod messages;
pub mod node;
pub mod queue;
pub mod registry;
pub mod state;
pub mod storage;
pub mod timer;

pub use context::ActorContext;
pub use error::{ActorError, Result, StateError, StorageError};
pub use executor::{Executor, ExecutorStats};
pub use health::{HealthStatus, NodeHealth};
pub use node::ActorNode;
pub use queue::{ActorMessageQueue, ActorQueueStats, QueueStats};
pub use registry::{Actor, ActorKind, ActorTable};
pub use state::{ActorState, WalRecord};
pub use storage::DurableState;
