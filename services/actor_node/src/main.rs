//! Actor node launcher
//!
//! Loads the node configuration (file, then `ACTOR__*` environment, then
//! command line), starts a node with the builtin actors and runs it until
//! Ctrl-C.

mod demo;

use actor_config::NodeConfig;
use anyhow::{bail, Context, Result};
use clap::Parser;
use messaging_actors::ActorNode;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use types::NetworkSpec;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name
    #[arg(long)]
    name: Option<String>,

    /// Listen URL, e.g. http://0.0.0.0:8000/api/v1/actor
    #[arg(long)]
    listen: Option<String>,

    /// Network membership as name@url, repeatable
    #[arg(long = "network")]
    networks: Vec<String>,

    /// Total worker count
    #[arg(long)]
    concurrency: Option<usize>,

    /// WAL directory, memory storage when unset
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Also host the demo actors
    #[arg(long)]
    demo: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) -> Result<()> {
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(listen) = &self.listen {
            let url = reqwest::Url::parse(listen)
                .with_context(|| format!("Invalid listen URL {}", listen))?;
            if let Some(host) = url.host_str() {
                config.host = host.to_string();
            }
            if let Some(port) = url.port() {
                config.port = port;
            }
            let path = url.path();
            if path != "/" {
                config.subpath = path.to_string();
            }
        }
        for spec in &self.networks {
            match NetworkSpec::parse(spec) {
                Some(network) => config.networks.push(network),
                None => bail!("Invalid network {:?}, expected name@url", spec),
            }
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = Some(dir.clone());
        }
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = NodeConfig::load(args.config.as_deref())?;
    args.apply(&mut config)?;
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting actor node {}", config.node_name());
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let actors = if args.demo { demo::actors() } else { Vec::new() };
    let node = ActorNode::new(config, actors)?;
    node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    info!("Shutdown signal received");
    node.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides() {
        let args = Args::parse_from([
            "actor-node",
            "--name",
            "worker-1",
            "--listen",
            "http://10.0.0.2:6790/api/actor",
            "--network",
            "lan@http://10.0.0.2:6790/api/actor",
            "--concurrency",
            "12",
        ]);
        let mut config = NodeConfig::default();
        args.apply(&mut config).unwrap();
        assert_eq!(config.node_name(), "worker-1");
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.port, 6790);
        assert_eq!(config.subpath, "/api/actor");
        assert_eq!(config.networks[0].name, "lan");
        assert_eq!(config.concurrency, 12);
        config.validate().unwrap();
    }

    #[test]
    fn test_apply_rejects_bad_network() {
        let args = Args::parse_from(["actor-node", "--network", "lan"]);
        let mut config = NodeConfig::default();
        assert!(args.apply(&mut config).is_err());
    }
}
