//! # Node Health
//!
//! Snapshot served by `actor.health` and `GET <subpath>/health`:
//!
//! - registry contents (current node, registry node, known nodes)
//! - queue depth per actor and WAL counters
//! - worker pool sizes and executor counters
//! - sender counters

use crate::executor::{Executor, ExecutorStats};
use crate::queue::QueueStats;
use crate::registry::ActorKind;
use network::SenderStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::NodeSpec;

/// Node lifecycle levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Recovering state, receiver not bound yet
    Starting,
    /// Accepting and executing messages
    Healthy,
    /// Draining workers, no new messages accepted
    Stopping,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Starting,
            1 => HealthStatus::Healthy,
            _ => HealthStatus::Stopping,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Starting => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Stopping => 2,
        }
    }
}

/// Shared lifecycle flag, written by the node and read by health snapshots
#[derive(Debug)]
pub struct NodeStatus {
    status: AtomicU8,
    started_at: SystemTime,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(HealthStatus::Starting.as_u8()),
            started_at: SystemTime::now(),
        }
    }
}

impl NodeStatus {
    pub fn get(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: HealthStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }

    pub fn started_at_secs(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub current_node: NodeSpec,
    pub registry_node: Option<NodeSpec>,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActorInfo {
    pub name: String,
    pub kind: ActorKind,
    pub timer_secs: Option<f64>,
    pub param_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub name: String,
    pub status: HealthStatus,
    pub host: String,
    pub port: u16,
    pub subpath: String,
    pub started_at: u64,
    pub uptime_secs: u64,
    pub registry: RegistryHealth,
    pub actors: Vec<ActorInfo>,
    pub queue: QueueStats,
    pub executor: ExecutorStats,
    pub sender: SenderStats,
}

impl NodeHealth {
    pub fn collect(executor: &Executor, status: &NodeStatus) -> Self {
        let config = executor.config();
        let registry = executor.registry();
        let actors = executor
            .table()
            .iter()
            .map(|actor| ActorInfo {
                name: actor.name.clone(),
                kind: actor.kind(),
                timer_secs: actor.timer.map(|t| t.as_secs_f64()),
                param_type: actor.param_type,
            })
            .collect();
        Self {
            name: registry.current_node_name().to_string(),
            status: status.get(),
            host: config.host.clone(),
            port: config.port,
            subpath: config.subpath.clone(),
            started_at: status.started_at_secs(),
            uptime_secs: status.uptime().as_secs(),
            registry: RegistryHealth {
                current_node: registry.current_node().to_spec(),
                registry_node: registry.registry_node().map(|node| node.to_spec()),
                nodes: registry.to_spec(),
            },
            actors,
            queue: executor.queue().stats(),
            executor: executor.stats(),
            sender: executor.http().stats(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status_transitions() {
        let status = NodeStatus::default();
        assert_eq!(status.get(), HealthStatus::Starting);
        status.set(HealthStatus::Healthy);
        assert_eq!(status.get(), HealthStatus::Healthy);
        status.set(HealthStatus::Stopping);
        assert_eq!(status.get(), HealthStatus::Stopping);
        assert_eq!(
            serde_json::to_value(HealthStatus::Stopping).unwrap(),
            serde_json::json!("stopping")
        );
    }
}
