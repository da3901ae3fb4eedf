//! Shared data model (spec §3): node identity, liveness state, and the
//! read-only views the rest of the crate is built from.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque, stable name for a cluster peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Liveness state tracked by the failure detector (C2).
///
/// Transitions are monotone within an observation epoch: `Healthy` ->
/// `Suspect` on first-heartbeat-timeout, `Suspect` -> `Dead` on
/// extended-timeout, any -> `Healthy` on a fresh heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Unknown,
    Healthy,
    Suspect,
    Dead,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Unknown
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Unknown => "unknown",
            NodeState::Healthy => "healthy",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Per-node observation consumed by the load planner (C4).
///
/// Invariant: `disk_usage_bytes <= disk_capacity_bytes`. `update_metrics`
/// is expected to reject observations that violate this at the ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub disk_capacity_bytes: u64,
    pub disk_usage_bytes: u64,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub shard_count: u64,
    /// Unix timestamp (seconds) of the last update, stamped by
    /// `LoadPlanner::update_metrics`, not supplied by the caller.
    pub last_updated: u64,
}

impl NodeMetrics {
    pub fn disk_usage_ratio(&self) -> f64 {
        if self.disk_capacity_bytes == 0 {
            0.0
        } else {
            self.disk_usage_bytes as f64 / self.disk_capacity_bytes as f64
        }
    }

    pub fn memory_usage_gb(&self) -> f64 {
        self.memory_usage_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Weights for the monotone `load_score` derivation used only by C4.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadScoreWeights {
    pub cpu: f64,
    pub memory_gb: f64,
    pub disk_pct: f64,
    pub shard: f64,
}

impl Default for LoadScoreWeights {
    fn default() -> Self {
        Self { cpu: 1.0, memory_gb: 1.0, disk_pct: 1.0, shard: 1.0 }
    }
}

/// Externally-visible shape of a node, as handed to the HTTP layer (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    pub status: NodeState,
    pub is_leader: bool,
    pub last_seen: u64,
    pub metrics: Option<NodeMetrics>,
}

/// Read-only derived view of overall cluster health. Rebuilt on demand, never
/// stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub leader_id: Option<NodeId>,
    pub last_election_time: Option<u64>,
    pub active_migrations: usize,
}

/// Current unix time in seconds. Centralized so tests can reason about the
/// single place "now" is read from.
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
