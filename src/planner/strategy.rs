//! The four rebalancing strategies (spec.md §4.4), dispatched polymorphically
//! by delegation rather than inheritance, per spec.md §9's design note.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::types::{LoadScoreWeights, NodeId, NodeMetrics};

use super::MigrationPlan;

/// One scored node, carried between `evaluate` and `generate_plan` so a
/// strategy never has to recompute scores.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node_id: NodeId,
    pub metrics: NodeMetrics,
    pub score: f64,
}

/// A polymorphic capability set: decide if rebalancing is warranted, and if
/// so, what to move. `metrics` is always passed pre-sorted by `NodeId` so
/// every strategy sees a deterministic iteration order (spec.md §4.4
/// tie-break rule).
pub trait RebalanceStrategy: Send + Sync {
    /// `(need_rebalance, imbalance_score)`.
    fn evaluate(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> (bool, f64);

    fn generate_plan(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> Vec<MigrationPlan>;

    fn name(&self) -> &'static str;
}

const ASSUMED_SHARD_BYTES: u64 = 1024 * 1024 * 1024;

/// Sample variance (n-1 denominator) over `mean`, expressed as a percentage
/// per spec.md §4.4. A single score has no spread to estimate and scores
/// `0.0`.
fn coefficient_of_variation(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean == 0.0 || scores.len() < 2 {
        return 0.0;
    }
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (scores.len() - 1) as f64;
    (variance.sqrt() / mean) * 100.0
}

fn need_rebalance_threshold(node_count: usize) -> f64 {
    if node_count < 3 {
        30.0
    } else {
        20.0
    }
}

fn synthetic_shard_ids(node_id: &NodeId, count: u64) -> Vec<String> {
    (0..count).map(|i| format!("{}-shard-{}", node_id, i)).collect()
}

fn pair_and_migrate(
    scored: &[ScoredNode],
    shards_to_move: impl Fn(&ScoredNode, &ScoredNode) -> u64,
    skip_pair: impl Fn(&ScoredNode, &ScoredNode) -> bool,
) -> Vec<MigrationPlan> {
    let n = scored.len();
    if n < 2 {
        return Vec::new();
    }
    let mut descending = scored.to_vec();
    descending.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.node_id.cmp(&b.node_id)));
    let pair_count = ((n as f64) / 3.0).ceil() as usize;

    let mut plans = Vec::new();
    for i in 0..pair_count {
        let hi_idx = i;
        let lo_idx = n - 1 - i;
        if hi_idx >= lo_idx {
            break;
        }
        let source = &descending[hi_idx];
        let target = &descending[lo_idx];
        if source.node_id == target.node_id || skip_pair(source, target) {
            continue;
        }
        let count = shards_to_move(source, target);
        if count == 0 {
            continue;
        }
        plans.push(MigrationPlan {
            plan_id: Uuid::new_v4().to_string(),
            source: source.node_id.clone(),
            target: target.node_id.clone(),
            shard_ids: synthetic_shard_ids(&source.node_id, count),
            estimated_bytes: count * ASSUMED_SHARD_BYTES,
            priority: (10 - i as i32).max(1) as u8,
        });
    }
    plans
}

fn weighted_scores(metrics: &BTreeMap<NodeId, NodeMetrics>, weights: &LoadScoreWeights) -> Vec<ScoredNode> {
    let avg_shards: f64 = {
        let total: u64 = metrics.values().map(|m| m.shard_count).sum();
        if metrics.is_empty() {
            1.0
        } else {
            (total as f64 / metrics.len() as f64).max(1.0)
        }
    };
    metrics
        .iter()
        .map(|(id, m)| {
            let score = weights.cpu * m.cpu_usage_percent
                + weights.memory_gb * m.memory_usage_gb()
                + weights.disk_pct * (m.disk_usage_ratio() * 100.0)
                + weights.shard * (m.shard_count as f64 / avg_shards) * 100.0;
            ScoredNode { node_id: id.clone(), metrics: m.clone(), score }
        })
        .collect()
}

/// Strategy 1: `score = w_cpu·cpu + w_mem·mem_gb + w_disk·disk_pct + w_shard·(shard_count/avg)·100`.
pub struct WeightedScoreStrategy {
    pub weights: LoadScoreWeights,
}

impl Default for WeightedScoreStrategy {
    fn default() -> Self {
        Self { weights: LoadScoreWeights::default() }
    }
}

impl RebalanceStrategy for WeightedScoreStrategy {
    fn evaluate(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> (bool, f64) {
        let scored = weighted_scores(metrics, &self.weights);
        let scores: Vec<f64> = scored.iter().map(|s| s.score).collect();
        let imbalance = coefficient_of_variation(&scores);
        (imbalance > need_rebalance_threshold(metrics.len()), imbalance)
    }

    fn generate_plan(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> Vec<MigrationPlan> {
        let scored = weighted_scores(metrics, &self.weights);
        pair_and_migrate(
            &scored,
            |source, target| {
                let source_excess = (source.metrics.shard_count as f64 * 0.25) as u64;
                let target_deficit = source.metrics.shard_count.saturating_sub(target.metrics.shard_count);
                let source_quarter = source.metrics.shard_count / 4;
                [source_excess, target_deficit, source_quarter, 1].into_iter().min().unwrap_or(0)
            },
            |_, _| false,
        )
    }

    fn name(&self) -> &'static str {
        "weighted-score"
    }
}

/// Strategy 2: `score = disk-usage-ratio`; pairs use 30% of source shards;
/// skipped when the ratio gap is under 0.1.
#[derive(Default)]
pub struct CapacityBalanceStrategy;

impl RebalanceStrategy for CapacityBalanceStrategy {
    fn evaluate(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> (bool, f64) {
        let scores: Vec<f64> = metrics.values().map(|m| m.disk_usage_ratio()).collect();
        let imbalance = coefficient_of_variation(&scores) ;
        (imbalance > need_rebalance_threshold(metrics.len()), imbalance)
    }

    fn generate_plan(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> Vec<MigrationPlan> {
        let scored: Vec<ScoredNode> = metrics
            .iter()
            .map(|(id, m)| ScoredNode { node_id: id.clone(), metrics: m.clone(), score: m.disk_usage_ratio() })
            .collect();
        pair_and_migrate(
            &scored,
            |source, _target| (source.metrics.shard_count as f64 * 0.30) as u64,
            |source, target| (source.score - target.score).abs() < 0.1,
        )
    }

    fn name(&self) -> &'static str {
        "capacity-balance"
    }
}

/// Strategy 3: CPU usage stands in for a true access-rate signal; pairs use
/// a fifth of the source's shards.
#[derive(Default)]
pub struct AccessFrequencyStrategy;

impl RebalanceStrategy for AccessFrequencyStrategy {
    fn evaluate(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> (bool, f64) {
        let scores: Vec<f64> = metrics.values().map(|m| m.cpu_usage_percent).collect();
        let imbalance = coefficient_of_variation(&scores);
        (imbalance > need_rebalance_threshold(metrics.len()), imbalance)
    }

    fn generate_plan(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> Vec<MigrationPlan> {
        let scored: Vec<ScoredNode> = metrics
            .iter()
            .map(|(id, m)| ScoredNode { node_id: id.clone(), metrics: m.clone(), score: m.cpu_usage_percent })
            .collect();
        pair_and_migrate(&scored, |source, _target| source.metrics.shard_count / 5, |_, _| false)
    }

    fn name(&self) -> &'static str {
        "access-frequency"
    }
}

/// Strategy 4: a weighted sum of component strategies; delegates plan
/// generation to whichever component scored highest.
pub struct CompositeStrategy {
    pub components: Vec<(Box<dyn RebalanceStrategy>, f64)>,
}

impl CompositeStrategy {
    pub fn new(components: Vec<(Box<dyn RebalanceStrategy>, f64)>) -> Self {
        Self { components }
    }
}

impl RebalanceStrategy for CompositeStrategy {
    fn evaluate(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> (bool, f64) {
        let mut need = false;
        let mut weighted_sum = 0.0;
        for (strategy, weight) in &self.components {
            let (component_need, score) = strategy.evaluate(metrics);
            need = need || component_need;
            weighted_sum += weight * score;
        }
        (need, weighted_sum)
    }

    fn generate_plan(&self, metrics: &BTreeMap<NodeId, NodeMetrics>) -> Vec<MigrationPlan> {
        let best = self
            .components
            .iter()
            .map(|(strategy, _)| (strategy, strategy.evaluate(metrics).1))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        match best {
            Some((strategy, _)) => strategy.generate_plan(metrics),
            None => Vec::new(),
        }
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeMetrics;

    fn metrics(cpu: f64, mem_gb: f64, disk_pct: f64, shards: u64) -> NodeMetrics {
        let capacity = 1_000_000_000_000u64;
        NodeMetrics {
            disk_capacity_bytes: capacity,
            disk_usage_bytes: (capacity as f64 * disk_pct / 100.0) as u64,
            cpu_usage_percent: cpu,
            memory_usage_bytes: (mem_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            shard_count: shards,
            last_updated: 0,
        }
    }

    #[test]
    fn weighted_score_flags_imbalanced_cluster() {
        let mut m = BTreeMap::new();
        m.insert(NodeId::new("hot"), metrics(90.0, 80.0, 85.0, 500));
        m.insert(NodeId::new("mid"), metrics(30.0, 20.0, 25.0, 100));
        m.insert(NodeId::new("cold"), metrics(20.0, 15.0, 20.0, 80));

        let strategy = WeightedScoreStrategy::default();
        let (need, score) = strategy.evaluate(&m);
        assert!(need);
        assert!(score > 20.0);

        let plans = strategy.generate_plan(&m);
        assert!(!plans.is_empty());
        let first = &plans[0];
        assert_eq!(first.source, NodeId::new("hot"));
        assert_eq!(first.target, NodeId::new("cold"));
        assert!(!first.shard_ids.is_empty());
        assert_eq!(first.priority, 10);
    }

    #[test]
    fn balanced_cluster_needs_no_rebalance() {
        let mut m = BTreeMap::new();
        m.insert(NodeId::new("a"), metrics(40.0, 40.0, 40.0, 100));
        m.insert(NodeId::new("b"), metrics(41.0, 39.0, 41.0, 101));
        m.insert(NodeId::new("c"), metrics(39.0, 41.0, 39.0, 99));

        let (need, _) = WeightedScoreStrategy::default().evaluate(&m);
        assert!(!need);
    }
}
