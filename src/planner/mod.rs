//! C4: collects per-node metrics, evaluates cluster imbalance, and emits
//! migration plans under a pluggable strategy (spec.md §4.4).

pub mod strategy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::executor::MigrationTask;
use crate::types::{unix_now, NodeId, NodeMetrics};

pub use strategy::{
    AccessFrequencyStrategy, CapacityBalanceStrategy, CompositeStrategy, RebalanceStrategy,
    ScoredNode, WeightedScoreStrategy,
};

/// An immutable record describing one source→target shard movement, created
/// by a strategy and handed off to C5 (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub plan_id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub shard_ids: Vec<String>,
    pub estimated_bytes: u64,
    pub priority: u8,
}

/// Per-dimension aggregate view (spec.md §4.4 `cluster_stats`), supplemented
/// with min/max alongside the mean/variance the distilled spec names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionStats {
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStats {
    pub node_count: usize,
    pub total_shard_count: u64,
    pub total_disk_usage_bytes: u64,
    pub total_disk_capacity_bytes: u64,
    pub cpu: DimensionStats,
    pub memory_gb: DimensionStats,
    pub disk_pct: DimensionStats,
    pub shard_count: DimensionStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerStatus {
    pub is_rebalancing: bool,
    pub last_rebalance: u64,
    pub active_tasks_count: usize,
    pub active_tasks: Vec<MigrationTask>,
}

/// Sample variance (Bessel's correction, n-1 denominator) per spec.md §4.4.
/// A single-element sample has no estimate of spread and reports `0.0`.
fn dimension_stats(values: &[f64]) -> DimensionStats {
    if values.is_empty() {
        return DimensionStats::default();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
    } else {
        0.0
    };
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    DimensionStats { mean, variance, min, max }
}

/// Callback the planner hands generated plans to; the cluster manager wires
/// this to `MigrationExecutor::submit`.
pub trait PlanSink: Send + Sync + 'static {
    fn submit(&self, plans: Vec<MigrationPlan>);
}

struct Inner {
    config: Arc<ClusterConfig>,
    strategy: Box<dyn RebalanceStrategy>,
    sink: Arc<dyn PlanSink>,
    metrics: RwLock<HashMap<NodeId, NodeMetrics>>,
    rebalancing: std::sync::atomic::AtomicBool,
    last_rebalance: std::sync::atomic::AtomicU64,
}

/// Cheaply-cloneable handle to the running load planner.
#[derive(Clone)]
pub struct LoadPlanner {
    inner: Arc<Inner>,
    trigger_tx: mpsc::Sender<()>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl LoadPlanner {
    pub fn spawn(config: Arc<ClusterConfig>, strategy: Box<dyn RebalanceStrategy>, sink: Arc<dyn PlanSink>) -> Self {
        let inner = Arc::new(Inner {
            config: config.clone(),
            strategy,
            sink,
            metrics: RwLock::new(HashMap::new()),
            rebalancing: std::sync::atomic::AtomicBool::new(false),
            last_rebalance: std::sync::atomic::AtomicU64::new(0),
        });

        // A trigger channel of capacity 1 gives the "coalesced, non-blocking,
        // second-trigger-before-first-completes-is-a-no-op" semantics for free:
        // a full channel means an evaluation is already queued or running.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_evaluation_loop(inner.clone(), trigger_rx));

        Self { inner, trigger_tx, task: Arc::new(std::sync::Mutex::new(Some(task))) }
    }

    pub async fn update_metrics(&self, node_id: NodeId, mut metrics: NodeMetrics) {
        metrics.last_updated = unix_now();
        self.inner.metrics.write().await.insert(node_id, metrics);
    }

    pub async fn get_metrics(&self, node_id: &NodeId) -> Option<NodeMetrics> {
        self.inner.metrics.read().await.get(node_id).cloned()
    }

    pub async fn all_metrics(&self) -> HashMap<NodeId, NodeMetrics> {
        self.inner.metrics.read().await.clone()
    }

    pub async fn cluster_stats(&self) -> ClusterStats {
        let metrics = self.inner.metrics.read().await;
        let cpu: Vec<f64> = metrics.values().map(|m| m.cpu_usage_percent).collect();
        let mem: Vec<f64> = metrics.values().map(|m| m.memory_usage_gb()).collect();
        let disk: Vec<f64> = metrics.values().map(|m| m.disk_usage_ratio() * 100.0).collect();
        let shards: Vec<f64> = metrics.values().map(|m| m.shard_count as f64).collect();

        ClusterStats {
            node_count: metrics.len(),
            total_shard_count: metrics.values().map(|m| m.shard_count).sum(),
            total_disk_usage_bytes: metrics.values().map(|m| m.disk_usage_bytes).sum(),
            total_disk_capacity_bytes: metrics.values().map(|m| m.disk_capacity_bytes).sum(),
            cpu: dimension_stats(&cpu),
            memory_gb: dimension_stats(&mem),
            disk_pct: dimension_stats(&disk),
            shard_count: dimension_stats(&shards),
        }
    }

    /// Enqueue a one-shot evaluation request. Non-blocking; coalesced.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    pub fn status(&self) -> PlannerStatus {
        PlannerStatus {
            is_rebalancing: self.inner.rebalancing.load(std::sync::atomic::Ordering::Relaxed),
            last_rebalance: self.inner.last_rebalance.load(std::sync::atomic::Ordering::Relaxed),
            active_tasks_count: 0,
            active_tasks: Vec::new(),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_evaluation_loop(inner: Arc<Inner>, mut trigger_rx: mpsc::Receiver<()>) {
    let mut ticker = tokio::time::interval(inner.config.rebalance_evaluation_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = trigger_rx.recv() => {}
            else => break,
        }
        evaluate_once(&inner).await;
    }
}

async fn evaluate_once(inner: &Arc<Inner>) {
    use std::sync::atomic::Ordering;

    if inner.rebalancing.swap(true, Ordering::AcqRel) {
        return;
    }

    let result = async {
        let last = inner.last_rebalance.load(Ordering::Relaxed);
        let now = unix_now();
        if last != 0 && now.saturating_sub(last) < inner.config.min_migration_interval.as_secs() {
            return;
        }

        let snapshot: BTreeMap<NodeId, NodeMetrics> = inner.metrics.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if snapshot.len() < 2 {
            return;
        }

        let (need, score) = inner.strategy.evaluate(&snapshot);
        tracing::debug!(strategy = inner.strategy.name(), need, score, "rebalance evaluation");
        if need {
            let plans = inner.strategy.generate_plan(&snapshot);
            if !plans.is_empty() {
                inner.sink.submit(plans);
            }
            inner.last_rebalance.store(unix_now(), Ordering::Relaxed);
        }
    };
    result.await;
    inner.rebalancing.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl PlanSink for NullSink {
        fn submit(&self, _plans: Vec<MigrationPlan>) {}
    }

    #[tokio::test]
    async fn update_then_get_round_trips_metrics() {
        let config = Arc::new(ClusterConfig::default());
        let planner = LoadPlanner::spawn(config, Box::new(WeightedScoreStrategy::default()), Arc::new(NullSink));
        let metrics = NodeMetrics {
            disk_capacity_bytes: 100,
            disk_usage_bytes: 50,
            cpu_usage_percent: 10.0,
            memory_usage_bytes: 1024,
            shard_count: 5,
            last_updated: 0,
        };
        planner.update_metrics(NodeId::new("n1"), metrics.clone()).await;
        let stored = planner.get_metrics(&NodeId::new("n1")).await.unwrap();
        assert_eq!(stored.disk_usage_bytes, metrics.disk_usage_bytes);
        assert_eq!(stored.shard_count, metrics.shard_count);
        planner.shutdown().await;
    }
}
