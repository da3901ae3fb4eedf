//! A runnable three-node demo: wires an in-memory storage/transport pair for
//! the consensus core, lets the cluster elect a leader, replicates a couple
//! of entries, and prints what each node's applied stream saw.
//!
//! Not a test — a hands-on way to watch the coordination core run without
//! a real network or disk. `cargo run --bin demo`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clustercore::config::ClusterConfig;
use clustercore::consensus::{ChannelHub, ConsensusNode, MemConsensusStorage, NullTransport};
use clustercore::error::Result;
use clustercore::executor::DataClient;
use clustercore::failure_detector::NullHeartbeatTransport;
use clustercore::planner::strategy::WeightedScoreStrategy;
use clustercore::cluster_manager::ClusterManager;
use clustercore::types::NodeId;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

struct NoopDataClient;

#[async_trait]
impl DataClient for NoopDataClient {
    async fn transfer(
        &self,
        _source: &NodeId,
        _target: &NodeId,
        shard_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<u64> {
        Ok(shard_ids.len() as u64 * 1024 * 1024 * 1024)
    }

    async fn validate(
        &self,
        _source: &NodeId,
        _target: &NodeId,
        _shard_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    clustercore::telemetry::init();

    let ids: Vec<NodeId> = vec!["1".into(), "2".into(), "3".into()];
    let hub = ChannelHub::new();

    let mut managers = Vec::new();
    let mut consensus_nodes = Vec::new();

    for id in &ids {
        let peers: Vec<NodeId> = ids.iter().filter(|p| *p != id).cloned().collect();
        let config = Arc::new(ClusterConfig::new(id.clone(), peers));
        let storage = Arc::new(MemConsensusStorage::new());
        let transport = Arc::new(hub.transport_for(id.clone()));

        let (node, step_tx) = ConsensusNode::spawn(id.clone(), config.clone(), storage, transport);
        hub.register(id.clone(), step_tx).await;
        consensus_nodes.push(node.clone());

        let manager = ClusterManager::new(
            config,
            node,
            Arc::new(NullHeartbeatTransport),
            Box::new(WeightedScoreStrategy::default()),
            Arc::new(NoopDataClient),
        );
        manager.start().await.expect("cluster manager start");
        managers.push(manager);
    }

    // Single-node bootstrap never happens here (3-node cluster); give the
    // randomized election timers a few rounds to converge.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut leader_idx = None;
    for (i, manager) in managers.iter().enumerate() {
        if manager.is_leader() {
            println!("node {} is leader", ids[i]);
            leader_idx = Some(i);
        }
    }

    if let Some(i) = leader_idx {
        let leader_node = &consensus_nodes[i];
        leader_node.propose(b"hello".to_vec());
        leader_node.propose(b"world".to_vec());
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for (i, node) in consensus_nodes.iter().enumerate() {
        let metrics = node.metrics();
        println!(
            "node {} term={} commit_index={} role_is_leader={}",
            ids[i], metrics.term, metrics.commit_index, metrics.is_leader
        );
    }

    // Also drain a brief slice of node 1's applied stream to show ordering,
    // if it was captured early enough to still hold both entries.
    let mut applied = consensus_nodes[0].applied_stream().await;
    let drain = tokio::time::timeout(Duration::from_millis(200), applied.next()).await;
    if let Ok(Some(item)) = drain {
        println!("node {} applied: {:?}", ids[0], item);
    }

    for manager in &managers {
        manager.stop().await;
    }
    for node in &consensus_nodes {
        node.shutdown().await;
    }
}
