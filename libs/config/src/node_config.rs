//! Node Configuration Module
//!
//! Provides configuration loading for actor nodes. A node reads an optional
//! TOML file and then applies `ACTOR__`-prefixed environment overrides
//! (double underscore separates nesting, e.g. `ACTOR__QUEUE__INBOX_HIGHSIZE`).

use crate::defaults;
use anyhow::{bail, Context, Result};
use codec::ContentEncoding;
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use types::{NetworkSpec, NodeSpec};

/// Main node configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name, defaults to `local-<port>`
    pub name: Option<String>,

    pub host: String,
    pub port: u16,

    /// HTTP path of the inbox endpoint
    pub subpath: String,

    /// Total worker count, split between blocking and cooperative pools
    pub concurrency: usize,

    /// Networks this node is reachable on, besides `localhost`
    pub networks: Vec<NetworkSpec>,

    /// Bootstrap registry node
    pub registry_node: Option<NodeSpec>,

    /// Shared secret checked on every inbound request
    pub token: Option<String>,

    /// WAL directory, memory only when unset
    pub storage_dir: Option<PathBuf>,

    /// Codec used for outgoing requests
    pub content_encoding: ContentEncoding,

    pub ask_timeout_secs: u64,

    /// Largest inbound request body, larger requests get 413
    pub max_body_size: usize,

    pub queue: QueueSettings,
    pub storage: StorageSettings,
}

/// Mailbox tuning
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub inbox_lowsize: usize,
    pub inbox_highsize: usize,
    pub outbox_lowsize: usize,
    pub outbox_highsize: usize,
    pub cycle_time_secs: f64,
    pub max_retry_count: u32,
    pub max_retry_time_secs: f64,
    pub fetcher_concurrency: usize,
    pub max_complete_size: usize,
}

/// Write-ahead log tuning
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub compact_min_records: u64,
    pub compact_ratio: u64,
    pub compact_max_delta: u64,
    pub sync_mode: WalSyncMode,
}

/// How far a WAL append is pushed before it counts as written
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncMode {
    /// Handed to the OS, survives a process crash but not a power loss
    #[default]
    Flush,
    /// `fdatasync` after every record
    Data,
    /// `fsync` after every record
    All,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: defaults::node::HOST.to_string(),
            port: defaults::node::PORT,
            subpath: defaults::node::SUBPATH.to_string(),
            concurrency: defaults::node::CONCURRENCY,
            networks: Vec::new(),
            registry_node: None,
            token: None,
            storage_dir: None,
            content_encoding: ContentEncoding::BinaryGzip,
            ask_timeout_secs: defaults::node::ASK_TIMEOUT_SECS,
            max_body_size: defaults::node::MAX_BODY_SIZE,
            queue: QueueSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        use defaults::queue::*;
        Self {
            inbox_lowsize: INBOX_LOWSIZE,
            inbox_highsize: INBOX_HIGHSIZE,
            outbox_lowsize: OUTBOX_LOWSIZE,
            outbox_highsize: OUTBOX_HIGHSIZE,
            cycle_time_secs: CYCLE_TIME_SECS,
            max_retry_count: MAX_RETRY_COUNT,
            max_retry_time_secs: MAX_RETRY_TIME_SECS,
            fetcher_concurrency: FETCHER_CONCURRENCY,
            max_complete_size: MAX_COMPLETE_SIZE,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        use defaults::storage::*;
        Self {
            compact_min_records: COMPACT_MIN_RECORDS,
            compact_ratio: COMPACT_RATIO,
            compact_max_delta: COMPACT_MAX_DELTA,
            sync_mode: WalSyncMode::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading node config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(defaults::node::ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut node_config: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        node_config.expand_env_vars()?;
        node_config.validate()?;
        debug!(name = %node_config.node_name(), "Node config loaded");
        Ok(node_config)
    }

    /// Expand environment variables in paths and URLs
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(dir) = &self.storage_dir {
            let raw = dir.to_string_lossy().to_string();
            let expanded =
                shellexpand::full(&raw).context("Failed to expand storage directory")?;
            self.storage_dir = Some(PathBuf::from(expanded.to_string()));
        }

        for network in &mut self.networks {
            let expanded =
                shellexpand::env(&network.url).context("Failed to expand network URL")?;
            network.url = expanded.to_string();
        }

        if let Some(token) = &self.token {
            let expanded = shellexpand::env(token).context("Failed to expand token")?;
            self.token = Some(expanded.to_string());
        }

        Ok(())
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_body_size == 0 {
            bail!("max_body_size must be positive");
        }
        if !self.subpath.starts_with('/') {
            bail!("subpath must start with '/': {:?}", self.subpath);
        }
        let q = &self.queue;
        if q.inbox_lowsize > q.inbox_highsize {
            bail!(
                "queue.inbox_lowsize ({}) exceeds queue.inbox_highsize ({})",
                q.inbox_lowsize,
                q.inbox_highsize
            );
        }
        if q.outbox_lowsize > q.outbox_highsize || q.outbox_highsize == 0 {
            bail!(
                "queue.outbox_lowsize ({}) must not exceed a non-zero queue.outbox_highsize ({})",
                q.outbox_lowsize,
                q.outbox_highsize
            );
        }
        if q.max_retry_count == 0 {
            bail!("queue.max_retry_count must be at least 1");
        }
        if q.fetcher_concurrency == 0 || q.max_complete_size == 0 {
            bail!("queue.fetcher_concurrency and queue.max_complete_size must be positive");
        }
        if self.storage.compact_ratio < 2 {
            bail!("storage.compact_ratio must be at least 2");
        }
        for network in &self.networks {
            if network.name.starts_with(defaults::node::LOCAL_NETWORK) {
                bail!("network name {:?} is reserved", network.name);
            }
        }
        Ok(())
    }

    /// Effective node name
    pub fn node_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("local-{}", self.port),
        }
    }

    /// Socket address the receiver binds
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Name of the loopback network only this node belongs to
    pub fn local_network_name(&self) -> String {
        format!("{}:{}", defaults::node::LOCAL_NETWORK, self.node_name())
    }

    /// Configured networks plus the loopback URL of this node
    pub fn all_networks(&self) -> Vec<NetworkSpec> {
        let mut networks = self.networks.clone();
        networks.push(NetworkSpec::new(
            self.local_network_name(),
            format!("http://127.0.0.1:{}{}", self.port, self.subpath),
        ));
        networks
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

/// Convenience function to load configuration from an optional file
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    NodeConfig::load(path)
}
