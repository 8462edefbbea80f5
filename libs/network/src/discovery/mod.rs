//! Service Discovery
//!
//! ## Purpose
//! Maps actor names to the nodes hosting their module and to the URLs those
//! nodes can be reached on from here.
//!
//! ## Architecture Role
//!
//! ```text
//! NodeSpec (config, registry node) → [ActorRegistry] → Sender (dst_url)
//!                                          ↓
//!                                   notify / fetch fan-out
//! ```

pub mod registry;

pub use registry::{ActorRegistry, NodeInfo};
