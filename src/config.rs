//! Configuration surface consumed by the core (spec §6).
//!
//! Loading, validation, and hot-reload live outside this crate; `ClusterConfig`
//! is plain data so any loader can hydrate it (e.g. via `serde`-based JSON,
//! YAML, or TOML decoding) and hand the result to
//! [`crate::cluster_manager::ClusterManager`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,

    #[serde(with = "duration_millis")]
    pub election_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub suspect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub dead_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,

    #[serde(with = "duration_millis")]
    pub rebalance_evaluation_interval: Duration,
    pub imbalance_threshold: f64,
    pub max_concurrent_migrations: usize,
    #[serde(with = "duration_millis")]
    pub min_migration_interval: Duration,
    #[serde(with = "duration_millis")]
    pub migration_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub heartbeat_rpc_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub validation_timeout: Duration,
    pub max_migration_retries: u32,
    pub migration_queue_capacity: usize,

    #[serde(with = "duration_millis")]
    pub shutdown_deadline: Duration,
    #[serde(with = "duration_millis")]
    pub node_info_cache_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(""),
            peers: Vec::new(),
            election_timeout: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(1),
            suspect_timeout: Duration::from_secs(3),
            dead_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(30),
            rebalance_evaluation_interval: Duration::from_secs(5 * 60),
            imbalance_threshold: 20.0,
            max_concurrent_migrations: 5,
            min_migration_interval: Duration::from_secs(30 * 60),
            migration_timeout: Duration::from_secs(2 * 60 * 60),
            heartbeat_rpc_timeout: Duration::from_secs(5),
            validation_timeout: Duration::from_secs(60),
            max_migration_retries: 3,
            migration_queue_capacity: 1024,
            shutdown_deadline: Duration::from_secs(30),
            node_info_cache_ttl: Duration::from_secs(10),
        }
    }
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<NodeId>, peers: Vec<NodeId>) -> Self {
        Self { node_id: node_id.into(), peers, ..Default::default() }
    }

    /// `peers` including `node_id`, exactly as `spec.md` §6 describes the
    /// `peers` field ("list of peer IDs including self").
    pub fn voting_members(&self) -> Vec<NodeId> {
        let mut members = self.peers.clone();
        if !members.contains(&self.node_id) {
            members.push(self.node_id.clone());
        }
        members
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
