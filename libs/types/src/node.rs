//! Node specs exchanged between nodes and written in configuration

use serde::{Deserialize, Serialize};

/// A URL on a named network segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub url: String,
}

/// What a node hosts and where it can be reached
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Parse the `name@url` form used on the command line
    pub fn parse(spec: &str) -> Option<Self> {
        let (name, url) = spec.split_once('@')?;
        if name.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self::new(name, url))
    }
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    pub fn with_network(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.networks.push(NetworkSpec::new(name, url));
        self
    }
}
