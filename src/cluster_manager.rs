//! The top-level Cluster Manager: owns C2–C5, wires their event streams to
//! one event loop, and exposes the external contract consumed by the HTTP
//! layer (spec.md §2, §6). Does not own C1 directly — the consensus node is
//! constructed by the caller (it needs concrete storage/transport types) and
//! handed in already spawned; C3 wraps it from here on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use crate::config::ClusterConfig;
use crate::consensus::ConsensusNode;
use crate::election::ElectionManager;
use crate::error::{Error, Result, DOMAIN_CLUSTER};
use crate::executor::{DataClient, ExecutorPlanSink, MigrationExecutor};
use crate::failure_detector::{FailureDetector, HeartbeatTransport};
use crate::planner::{LoadPlanner, PlannerStatus, RebalanceStrategy};
use crate::types::{unix_now, NodeId, NodeInfo, NodeMetrics, NodeState};

const LEADER_CHANGES_CAPACITY: usize = 10;

struct NodeRegistryEntry {
    address: String,
}

struct Inner {
    config: Arc<ClusterConfig>,
    self_id: NodeId,
    election: Arc<ElectionManager>,
    failure_detector: FailureDetector,
    planner: LoadPlanner,
    executor: MigrationExecutor,
    node_registry: RwLock<HashMap<NodeId, NodeRegistryEntry>>,
    node_info_cache: RwLock<HashMap<NodeId, (NodeInfo, Instant)>>,
    leader_changes_tx: broadcast::Sender<NodeId>,
    started: std::sync::atomic::AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Owns the whole coordination core for one process. Cheaply-cloneable;
/// all mutable state lives behind the shared `Inner`.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<Inner>,
    event_loop: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ClusterManager {
    pub fn new<T: HeartbeatTransport, D: DataClient>(
        config: Arc<ClusterConfig>,
        consensus: ConsensusNode,
        heartbeat_transport: Arc<T>,
        strategy: Box<dyn RebalanceStrategy>,
        data_client: Arc<D>,
    ) -> Self {
        let self_id = config.node_id.clone();
        let election = ElectionManager::new(self_id.clone(), consensus);
        let failure_detector = FailureDetector::spawn(self_id.clone(), config.clone(), heartbeat_transport);
        let executor = MigrationExecutor::new(config.clone(), data_client);
        let planner = LoadPlanner::spawn(config.clone(), strategy, Arc::new(ExecutorPlanSink::new(executor.clone())));

        let (leader_changes_tx, _) = broadcast::channel(LEADER_CHANGES_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            config,
            self_id,
            election,
            failure_detector,
            planner,
            executor,
            node_registry: RwLock::new(HashMap::new()),
            node_info_cache: RwLock::new(HashMap::new()),
            leader_changes_tx,
            started: std::sync::atomic::AtomicBool::new(false),
            stop_tx,
        });

        Self { inner, event_loop: Arc::new(tokio::sync::Mutex::new(None)) }
    }

    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Err(Error::already_exists(DOMAIN_CLUSTER, "cluster manager already started"));
        }
        self.inner.election.start().await?;
        self.inner.executor.start().await;

        let inner = self.inner.clone();
        let stop_rx = self.inner.stop_tx.subscribe();
        let handle = tokio::spawn(run_event_loop(inner, stop_rx));
        *self.event_loop.lock().await = Some(handle);
        Ok(())
    }

    /// Shut down in reverse-start order: C5 → C3 → C4 → C2 → C1 (the
    /// consensus node's own shutdown is the caller's responsibility, since
    /// it owns the concrete storage/transport types this manager was never
    /// handed). Overrunning `shutdown_deadline` on any step is logged, not
    /// fatal.
    pub async fn stop(&self) {
        let deadline = self.inner.config.shutdown_deadline;

        let _ = self.inner.stop_tx.send(true);
        if let Some(handle) = self.event_loop.lock().await.take() {
            let _ = tokio::time::timeout(deadline, handle).await;
        }

        with_deadline_warning(deadline, "executor", self.inner.executor.stop()).await;
        with_deadline_warning(deadline, "election manager", self.inner.election.stop()).await;
        with_deadline_warning(deadline, "load planner", self.inner.planner.shutdown()).await;
        with_deadline_warning(deadline, "failure detector", self.inner.failure_detector.clone().shutdown()).await;
    }

    pub fn is_leader(&self) -> bool {
        self.inner.election.is_leader()
    }

    pub async fn current_leader(&self) -> NodeId {
        self.inner.election.current_leader().await
    }

    pub async fn register_node(&self, id: NodeId, address: String) {
        self.inner.node_registry.write().await.insert(id.clone(), NodeRegistryEntry { address });
        self.inner.failure_detector.register(id);
        self.invalidate_cache().await;
    }

    pub async fn unregister_node(&self, id: &NodeId) {
        self.inner.node_registry.write().await.remove(id);
        self.inner.failure_detector.unregister(id);
        self.invalidate_cache().await;
    }

    pub async fn add_peer(&self, id: NodeId) -> Result<()> {
        self.inner.election.add_peer(id).await
    }

    pub async fn remove_peer(&self, id: NodeId) -> Result<()> {
        self.inner.election.remove_peer(id).await
    }

    pub async fn list_nodes(&self) -> Vec<NodeInfo> {
        let ids: Vec<NodeId> = self.inner.node_registry.read().await.keys().cloned().collect();
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(info) = self.get_node(&id).await {
                infos.push(info);
            }
        }
        infos
    }

    pub async fn get_node(&self, id: &NodeId) -> Result<NodeInfo> {
        if let Some((info, cached_at)) = self.inner.node_info_cache.read().await.get(id) {
            if cached_at.elapsed() < self.inner.config.node_info_cache_ttl {
                return Ok(info.clone());
            }
        }

        let address = {
            let registry = self.inner.node_registry.read().await;
            registry.get(id).map(|e| e.address.clone())
        };
        let address = address.ok_or_else(|| Error::not_found(DOMAIN_CLUSTER, format!("no such node: {}", id)))?;

        let status = self.inner.failure_detector.state(id);
        let current_leader = self.inner.election.current_leader().await;
        let metrics = self.inner.planner.get_metrics(id).await;

        let info = NodeInfo {
            node_id: id.clone(),
            address,
            status,
            is_leader: !current_leader.is_empty() && current_leader == *id,
            last_seen: unix_now(),
            metrics,
        };

        self.inner.node_info_cache.write().await.insert(id.clone(), (info.clone(), Instant::now()));
        Ok(info)
    }

    pub async fn get_leader(&self) -> Result<NodeInfo> {
        let leader = self.inner.election.current_leader().await;
        if leader.is_empty() {
            return Err(Error::unavailable(DOMAIN_CLUSTER, "no leader currently known"));
        }
        self.get_node(&leader).await
    }

    pub async fn update_node_metrics(&self, id: NodeId, metrics: NodeMetrics) {
        if metrics.disk_usage_bytes > metrics.disk_capacity_bytes {
            tracing::warn!(node = %id, "rejecting metrics update: disk_usage exceeds disk_capacity");
            return;
        }
        self.inner.planner.update_metrics(id, metrics).await;
    }

    pub fn trigger_rebalance(&self) {
        self.inner.planner.trigger();
    }

    pub async fn rebalance_status(&self) -> PlannerStatus {
        let mut status = self.inner.planner.status();
        let active = self.inner.executor.active_tasks().await;
        status.active_tasks_count = active.len();
        status.active_tasks = active;
        status
    }

    /// Broadcast channel (capacity 10, drop-oldest on overflow) of leader
    /// changes, re-published from C3.
    pub fn leader_changes(&self) -> broadcast::Receiver<NodeId> {
        self.inner.leader_changes_tx.subscribe()
    }

    async fn invalidate_cache(&self) {
        self.inner.node_info_cache.write().await.clear();
    }
}

async fn with_deadline_warning<F: std::future::Future<Output = ()>>(deadline: Duration, component: &str, fut: F) {
    if tokio::time::timeout(deadline, fut).await.is_err() {
        tracing::warn!(component, "component did not stop within the shutdown deadline");
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let mut leader_changes = inner.election.leader_changes();
    let mut state_changes = inner.failure_detector.state_changes();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => if *stop_rx.borrow() { break },
            leader = leader_changes.next() => {
                match leader {
                    Some(Ok(new_leader)) => handle_leader_change(&inner, new_leader).await,
                    Some(Err(_lagged)) => tracing::warn!("leader_changes consumer lagged, events dropped"),
                    None => break,
                }
            }
            change = state_changes.next() => {
                match change {
                    Some(Ok((node_id, state))) => handle_node_state_change(&inner, node_id, state).await,
                    Some(Err(_lagged)) => tracing::warn!("state_changes consumer lagged, events dropped"),
                    None => break,
                }
            }
        }
    }
}

async fn handle_leader_change(inner: &Arc<Inner>, new_leader: NodeId) {
    inner.node_info_cache.write().await.clear();
    let _ = inner.leader_changes_tx.send(new_leader.clone());
    if !new_leader.is_empty() && new_leader == inner.self_id {
        inner.planner.trigger();
    }
}

async fn handle_node_state_change(inner: &Arc<Inner>, node_id: NodeId, state: NodeState) {
    inner.node_info_cache.write().await.clear();
    if state == NodeState::Dead && inner.election.is_leader() {
        if let Err(e) = inner.election.remove_peer(node_id.clone()).await {
            tracing::warn!(node = %node_id, error = %e, "failed to remove dead peer from consensus membership");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::consensus::{ConsensusNode, MemConsensusStorage, NullTransport};
    use crate::executor::DataClient;
    use crate::planner::strategy::WeightedScoreStrategy;

    struct NoopDataClient;

    #[async_trait]
    impl DataClient for NoopDataClient {
        async fn transfer(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            shard_ids: &[String],
            _cancel: &tokio_util::sync::CancellationToken,
        ) -> Result<u64> {
            Ok(shard_ids.len() as u64)
        }

        async fn validate(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            _shard_ids: &[String],
            _cancel: &tokio_util::sync::CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn single_node_manager() -> ClusterManager {
        let id = NodeId::new("solo");
        let config = Arc::new(ClusterConfig::new(id.clone(), vec![]));
        let storage = Arc::new(MemConsensusStorage::new());
        let (node, _step_tx) = ConsensusNode::spawn(id, config.clone(), storage, Arc::new(NullTransport));
        let manager = ClusterManager::new(
            config,
            node,
            Arc::new(crate::failure_detector::NullHeartbeatTransport),
            Box::new(WeightedScoreStrategy::default()),
            Arc::new(NoopDataClient),
        );
        manager.start().await.expect("start");
        manager
    }

    #[tokio::test]
    async fn single_node_cluster_bootstraps_as_leader() {
        let manager = single_node_manager().await;
        // A lone member becomes its own leader with no election round trip needed.
        for _ in 0..50 {
            if manager.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_leader());
        manager.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let manager = single_node_manager().await;
        assert!(manager.start().await.is_err());
        manager.stop().await;
    }

    #[tokio::test]
    async fn unknown_node_lookup_is_not_found() {
        let manager = single_node_manager().await;
        let err = manager.get_node(&NodeId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        manager.stop().await;
    }

    #[tokio::test]
    async fn register_then_unregister_drops_node_from_listing() {
        let manager = single_node_manager().await;
        let id = NodeId::new("peer-x");
        manager.register_node(id.clone(), "10.0.0.1:9000".to_string()).await;
        assert!(manager.list_nodes().await.iter().any(|n| n.node_id == id));

        manager.unregister_node(&id).await;
        assert!(manager.get_node(&id).await.is_err());
        manager.stop().await;
    }
}

