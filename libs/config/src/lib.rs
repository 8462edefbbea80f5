//! # Actor Node Configuration
//!
//! Configuration management and defaults for actor nodes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use actor_config::NodeConfig;
//! use std::path::Path;
//!
//! let config = NodeConfig::load(Some(Path::new("config/node.toml"))).unwrap();
//! println!("{} listening on {}", config.node_name(), config.listen_addr().unwrap());
//! ```

pub mod defaults;
pub mod node_config;

// Re-export commonly used types
pub use node_config::{load_config, NodeConfig, QueueSettings, StorageSettings, WalSyncMode};
