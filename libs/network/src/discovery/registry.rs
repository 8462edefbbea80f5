//! Actor Registry
//!
//! Location-transparent lookup of actor destinations. The registry knows
//! every node, which modules each node hosts and on which named networks its
//! URLs live. A URL is only usable when the current node belongs to the same
//! network, which is how "same logical network segment" is expressed.
//!
//! All indices are rebuilt together under one lock on every membership
//! change, so readers always see a consistent snapshot.

use crate::{Result, TransportError};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};
use types::names::module_of;
use types::{generate_message_id, ActorMessage, NetworkSpec, NodeSpec};

/// One known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub modules: BTreeSet<String>,
    /// network name -> urls on that network
    pub networks: BTreeMap<String, BTreeSet<String>>,
}

impl NodeInfo {
    pub fn from_spec(spec: &NodeSpec) -> Self {
        let mut networks: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for network in &spec.networks {
            networks
                .entry(network.name.clone())
                .or_default()
                .insert(network.url.clone());
        }
        Self {
            name: spec.name.clone(),
            modules: spec.modules.iter().cloned().collect(),
            networks,
        }
    }

    pub fn to_spec(&self) -> NodeSpec {
        let mut networks = Vec::new();
        for (name, urls) in &self.networks {
            for url in urls {
                networks.push(NetworkSpec::new(name.clone(), url.clone()));
            }
        }
        NodeSpec {
            name: self.name.clone(),
            modules: self.modules.iter().cloned().collect(),
            networks,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryIndex {
    nodes: HashMap<String, NodeInfo>,
    /// node -> urls reachable from the current node
    node_urls: HashMap<String, Vec<String>>,
    /// module -> nodes hosting it
    module_nodes: HashMap<String, Vec<String>>,
}

/// Registry of nodes and the actor modules they host
#[derive(Debug)]
pub struct ActorRegistry {
    current_node: NodeInfo,
    registry_node: Option<NodeInfo>,
    index: RwLock<RegistryIndex>,
}

impl ActorRegistry {
    pub fn new(current_node: NodeSpec, registry_node: Option<NodeSpec>) -> Self {
        let registry = Self {
            current_node: NodeInfo::from_spec(&current_node),
            registry_node: registry_node.as_ref().map(NodeInfo::from_spec),
            index: RwLock::new(RegistryIndex::default()),
        };
        registry.rebuild(Vec::new());
        registry
    }

    pub fn current_node(&self) -> &NodeInfo {
        &self.current_node
    }

    pub fn current_node_name(&self) -> &str {
        &self.current_node.name
    }

    pub fn registry_node(&self) -> Option<&NodeInfo> {
        self.registry_node.as_ref()
    }

    fn rebuild(&self, mut nodes: Vec<NodeInfo>) {
        if let Some(registry_node) = &self.registry_node {
            nodes.push(registry_node.clone());
        }
        // the current node always wins over what others say about it
        nodes.push(self.current_node.clone());

        let local_networks: HashSet<&String> = self.current_node.networks.keys().collect();
        let mut index = RegistryIndex::default();
        for node in nodes {
            let mut urls = Vec::new();
            for (network, network_urls) in &node.networks {
                if local_networks.contains(network) {
                    urls.extend(network_urls.iter().cloned());
                }
            }
            index.node_urls.insert(node.name.clone(), urls);
            index.nodes.insert(node.name.clone(), node);
        }
        for node in index.nodes.values() {
            for module in &node.modules {
                index
                    .module_nodes
                    .entry(module.clone())
                    .or_default()
                    .push(node.name.clone());
            }
        }
        for names in index.module_nodes.values_mut() {
            names.sort();
        }

        debug!(
            nodes = index.nodes.len(),
            modules = index.module_nodes.len(),
            "Registry index rebuilt"
        );
        *self.index.write() = index;
    }

    /// Replace every known node with `specs`
    pub fn update(&self, specs: &[NodeSpec]) {
        let nodes = specs.iter().map(NodeInfo::from_spec).collect();
        self.rebuild(nodes);
        info!(nodes = specs.len(), "Registry updated");
    }

    /// Add or replace one node
    pub fn add(&self, spec: &NodeSpec) {
        let mut nodes: Vec<NodeInfo> = self
            .index
            .read()
            .nodes
            .values()
            .filter(|n| n.name != spec.name)
            .cloned()
            .collect();
        nodes.push(NodeInfo::from_spec(spec));
        self.rebuild(nodes);
    }

    /// Forget one node. The current and registry nodes cannot be removed.
    pub fn remove(&self, name: &str) {
        let nodes: Vec<NodeInfo> = self
            .index
            .read()
            .nodes
            .values()
            .filter(|n| n.name != name)
            .cloned()
            .collect();
        self.rebuild(nodes);
    }

    pub fn get_node(&self, name: &str) -> Option<NodeInfo> {
        self.index.read().nodes.get(name).cloned()
    }

    pub fn to_spec(&self) -> Vec<NodeSpec> {
        let index = self.index.read();
        let mut specs: Vec<NodeSpec> = index.nodes.values().map(NodeInfo::to_spec).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Nodes hosting the module of `actor`
    pub fn find_dst_nodes(&self, actor: &str) -> Vec<String> {
        self.index
            .read()
            .module_nodes
            .get(module_of(actor))
            .cloned()
            .unwrap_or_default()
    }

    /// A random node hosting `actor`
    pub fn choice_dst_node(&self, actor: &str) -> Option<String> {
        self.find_dst_nodes(actor)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// URLs of `node` on networks shared with the current node
    pub fn find_dst_urls(&self, node: &str) -> Vec<String> {
        self.index
            .read()
            .node_urls
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// A random reachable URL of `node`, none if unreachable
    pub fn choice_dst_url(&self, node: &str) -> Option<String> {
        self.find_dst_urls(node)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Fill in a blank source node and id
    pub fn complete_message(&self, mut message: ActorMessage) -> ActorMessage {
        if message.src_node.is_empty() {
            message.src_node = self.current_node.name.clone();
        }
        if message.id.is_empty() {
            message.id = generate_message_id();
        }
        message
    }

    /// Pick a destination node (if unpinned) and a URL for remote delivery
    pub fn resolve_destination(&self, mut message: ActorMessage) -> Result<ActorMessage> {
        let dst_node = match message.dst_node.clone() {
            Some(node) => node,
            None => self
                .choice_dst_node(&message.dst)
                .ok_or_else(|| {
                    TransportError::topology(format!("no node hosts actor {}", message.dst))
                })?,
        };
        if dst_node != self.current_node.name && message.dst_url.is_none() {
            let url = self.choice_dst_url(&dst_node).ok_or_else(|| {
                TransportError::topology(format!("node {} is unreachable", dst_node))
            })?;
            message.dst_url = Some(url);
        }
        message.dst_node = Some(dst_node);
        Ok(message)
    }

    pub fn is_local_node(&self, node: &str) -> bool {
        node == self.current_node.name
    }

    /// True when the message must be handled by the current node
    pub fn is_local_message(&self, message: &ActorMessage) -> bool {
        match &message.dst_node {
            Some(node) => self.is_local_node(node),
            None => self
                .current_node
                .modules
                .contains(module_of(&message.dst)),
        }
    }
}
