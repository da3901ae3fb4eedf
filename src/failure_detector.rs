//! C2: per-peer liveness tracking via periodic heartbeats (spec.md §4.2).
//!
//! Three cooperative loops — send, check, cleanup — share one
//! `RwLock`-guarded state map, the same shared-resource policy spec.md §5
//! prescribes for the NodeMetrics/NodeState maps. State-change events are
//! published on a `tokio::sync::broadcast` channel: a slow consumer falls
//! behind and sees a `Lagged` gap rather than stalling the detector, which
//! is the "drop-oldest when the consumer is slow" policy spec.md asks for.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::types::{NodeId, NodeState};

const STATE_CHANGES_CAPACITY: usize = 1024;

/// Send-side abstraction for the heartbeat RPC (spec.md §6): "POSTs a JSON
/// document `{sender_id, timestamp}` to `/api/v1/heartbeat` on each peer's
/// HTTP endpoint." Kept generic the way the teacher keeps `RaftNetwork`
/// generic over the consensus transport, so the `reqwest`-based
/// implementation is an adapter rather than baked into the send loop.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync + 'static {
    async fn send_heartbeat(&self, peer: &NodeId, sender_id: &NodeId, sent_at: SystemTime) -> Result<()>;
}

/// A transport with no peers reachable, useful for single-node tests.
pub struct NullHeartbeatTransport;

#[async_trait]
impl HeartbeatTransport for NullHeartbeatTransport {
    async fn send_heartbeat(&self, _peer: &NodeId, _sender_id: &NodeId, _sent_at: SystemTime) -> Result<()> {
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct HeartbeatBody {
    sender_id: String,
    timestamp: String,
}

/// Formats `t` as an RFC3339 UTC timestamp (`2024-01-02T03:04:05Z`) using
/// only civil-calendar arithmetic, since the heartbeat RPC body (spec.md §6)
/// is the only place in the core that needs a calendar date rather than a
/// raw unix timestamp.
fn rfc3339_utc(t: SystemTime) -> String {
    let secs = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);

    // Howard Hinnant's civil_from_days algorithm.
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };

    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z", year, month, day, hour, minute, second)
}

/// The production send-side adapter spec.md §6 describes literally: POST
/// `{sender_id, timestamp}` to `/api/v1/heartbeat` on each peer's base URL.
/// Any non-200 or transport error surfaces as `Unavailable` and is *not*
/// held against the peer by the sender — only the receiver's own check loop
/// may mark a peer dead, per spec.md's stated semantics.
pub struct HttpHeartbeatTransport {
    client: reqwest::Client,
    addresses: HashMap<NodeId, String>,
    timeout: Duration,
}

impl HttpHeartbeatTransport {
    pub fn new(addresses: HashMap<NodeId, String>, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), addresses, timeout }
    }
}

#[async_trait]
impl HeartbeatTransport for HttpHeartbeatTransport {
    async fn send_heartbeat(&self, peer: &NodeId, sender_id: &NodeId, sent_at: SystemTime) -> Result<()> {
        let base = self.addresses.get(peer).ok_or_else(|| {
            crate::error::Error::not_found(crate::error::DOMAIN_FAILURE_DETECTOR, format!("no address for peer {}", peer))
        })?;
        let url = format!("{}/api/v1/heartbeat", base.trim_end_matches('/'));
        let body = HeartbeatBody {
            sender_id: sender_id.to_string(),
            timestamp: rfc3339_utc(sent_at),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| crate::error::Error::unavailable(crate::error::DOMAIN_FAILURE_DETECTOR, e.to_string()))?;

        if !response.status().is_success() {
            return Err(crate::error::Error::unavailable(
                crate::error::DOMAIN_FAILURE_DETECTOR,
                format!("peer {} responded with status {}", peer, response.status()),
            ));
        }
        // Body is logged at debug but never interpreted, per spec.md §6.
        if let Ok(text) = response.text().await {
            tracing::debug!(peer = %peer, body = %text, "heartbeat response");
        }
        Ok(())
    }
}

struct PeerState {
    state: NodeState,
    last_heartbeat: Instant,
    fail_count: u32,
    dead_since: Option<Instant>,
}

impl PeerState {
    fn fresh(now: Instant) -> Self {
        Self { state: NodeState::Healthy, last_heartbeat: now, fail_count: 0, dead_since: None }
    }
}

struct Inner {
    self_id: NodeId,
    config: Arc<ClusterConfig>,
    peers: RwLock<HashMap<NodeId, PeerState>>,
    changes_tx: broadcast::Sender<(NodeId, NodeState)>,
    stop_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply-cloneable handle to a running failure detector.
#[derive(Clone)]
pub struct FailureDetector {
    inner: Arc<Inner>,
}

impl FailureDetector {
    /// Construct and start the three background loops.
    pub fn spawn<T: HeartbeatTransport>(self_id: NodeId, config: Arc<ClusterConfig>, transport: Arc<T>) -> Self {
        let (changes_tx, _) = broadcast::channel(STATE_CHANGES_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            self_id,
            config,
            peers: RwLock::new(HashMap::new()),
            changes_tx,
            stop_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let send_task = tokio::spawn(run_send_loop(inner.clone(), transport, stop_rx.clone()));
        let check_task = tokio::spawn(run_check_loop(inner.clone(), stop_rx.clone()));
        let cleanup_task = tokio::spawn(run_cleanup_loop(inner.clone(), stop_rx));
        inner.tasks.lock().unwrap().extend([send_task, check_task, cleanup_task]);

        Self { inner }
    }

    /// Begin tracking `node_id` (initial state Healthy).
    pub fn register(&self, node_id: NodeId) {
        let now = Instant::now();
        self.inner.peers.write().unwrap().entry(node_id).or_insert_with(|| PeerState::fresh(now));
    }

    pub fn unregister(&self, node_id: &NodeId) {
        self.inner.peers.write().unwrap().remove(node_id);
    }

    /// Refresh `last_heartbeat`; transition to Healthy (emitting an event)
    /// if the peer wasn't already, auto-registering if unknown.
    pub fn record_heartbeat(&self, node_id: NodeId) {
        let now = Instant::now();
        let mut peers = self.inner.peers.write().unwrap();
        match peers.get_mut(&node_id) {
            Some(peer) => {
                peer.last_heartbeat = now;
                peer.fail_count = 0;
                peer.dead_since = None;
                if peer.state != NodeState::Healthy {
                    peer.state = NodeState::Healthy;
                    drop(peers);
                    let _ = self.inner.changes_tx.send((node_id, NodeState::Healthy));
                }
            }
            None => {
                peers.insert(node_id, PeerState::fresh(now));
            }
        }
    }

    pub fn all_states(&self) -> HashMap<NodeId, NodeState> {
        self.inner.peers.read().unwrap().iter().map(|(id, p)| (id.clone(), p.state)).collect()
    }

    pub fn state(&self, node_id: &NodeId) -> NodeState {
        self.inner.peers.read().unwrap().get(node_id).map(|p| p.state).unwrap_or(NodeState::Unknown)
    }

    /// A stream of `(peer, new_state)` transitions. Multiple independent
    /// subscriptions are fine; each sees every event from the point it
    /// subscribed, modulo lag.
    pub fn state_changes(&self) -> BroadcastStream<(NodeId, NodeState)> {
        BroadcastStream::new(self.inner.changes_tx.subscribe())
    }

    /// Stop all three loops within one tick and drop the event sender last.
    pub async fn shutdown(self) {
        let _ = self.inner.stop_tx.send(true);
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_send_loop<T: HeartbeatTransport>(inner: Arc<Inner>, transport: Arc<T>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = stop.changed() => if *stop.borrow() { break },
            _ = ticker.tick() => {
                let peers: Vec<NodeId> = inner
                    .peers
                    .read()
                    .unwrap()
                    .keys()
                    .filter(|id| **id != inner.self_id)
                    .cloned()
                    .collect();
                for peer in peers {
                    if let Err(e) = transport.send_heartbeat(&peer, &inner.self_id, SystemTime::now()).await {
                        tracing::debug!(peer = %peer, error = %e, "heartbeat send failed, not held against the peer");
                    }
                }
            }
        }
    }
}

async fn run_check_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = stop.changed() => if *stop.borrow() { break },
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut transitions = Vec::new();
                {
                    let mut peers = inner.peers.write().unwrap();
                    for (id, peer) in peers.iter_mut() {
                        let age = now.saturating_duration_since(peer.last_heartbeat);
                        match peer.state {
                            NodeState::Healthy if age > inner.config.suspect_timeout => {
                                peer.state = NodeState::Suspect;
                                peer.fail_count += 1;
                                transitions.push((id.clone(), NodeState::Suspect));
                            }
                            NodeState::Suspect if age > inner.config.dead_timeout => {
                                peer.state = NodeState::Dead;
                                peer.dead_since = Some(now);
                                transitions.push((id.clone(), NodeState::Dead));
                            }
                            _ => {}
                        }
                    }
                }
                for (id, state) in transitions {
                    let _ = inner.changes_tx.send((id, state));
                }
            }
        }
    }
}

async fn run_cleanup_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
    let gc_after: Duration = inner.config.dead_timeout * 3;
    loop {
        tokio::select! {
            _ = stop.changed() => if *stop.borrow() { break },
            _ = ticker.tick() => {
                let now = Instant::now();
                inner.peers.write().unwrap().retain(|_, peer| {
                    !matches!((peer.state, peer.dead_since), (NodeState::Dead, Some(since)) if now.saturating_duration_since(since) > gc_after)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_utc_formats_known_instant() {
        let t = std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(rfc3339_utc(t), "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn register_then_unregister_resets_to_unknown() {
        let config = Arc::new(ClusterConfig::default());
        let detector = FailureDetector::spawn(NodeId::new("self"), config, Arc::new(NullHeartbeatTransport));
        let peer = NodeId::new("peer-a");
        detector.register(peer.clone());
        assert_eq!(detector.state(&peer), NodeState::Healthy);
        detector.unregister(&peer);
        assert_eq!(detector.state(&peer), NodeState::Unknown);
        detector.shutdown().await;
    }

    #[tokio::test]
    async fn record_heartbeat_auto_registers_unknown_peer() {
        let config = Arc::new(ClusterConfig::default());
        let detector = FailureDetector::spawn(NodeId::new("self"), config, Arc::new(NullHeartbeatTransport));
        let peer = NodeId::new("peer-b");
        detector.record_heartbeat(peer.clone());
        assert_eq!(detector.state(&peer), NodeState::Healthy);
        detector.shutdown().await;
    }

    /// spec.md §8 scenario 4: feed heartbeats for "A" every second for 10s
    /// while never feeding "B","C"; after 4s both are Suspect, after 11s
    /// both are Dead, while "A" stays Healthy throughout.
    #[tokio::test(flavor = "current_thread")]
    async fn unfed_peers_go_suspect_then_dead_on_schedule() {
        tokio::time::pause();
        let config = Arc::new(ClusterConfig::default());
        let detector = FailureDetector::spawn(NodeId::new("self"), config, Arc::new(NullHeartbeatTransport));

        let a = NodeId::new("A");
        let b = NodeId::new("B");
        let c = NodeId::new("C");
        detector.register(a.clone());
        detector.register(b.clone());
        detector.register(c.clone());

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            detector.record_heartbeat(a.clone());
        }

        assert_eq!(detector.state(&a), NodeState::Healthy);
        assert_eq!(detector.state(&b), NodeState::Suspect);
        assert_eq!(detector.state(&c), NodeState::Suspect);

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(detector.state(&a), NodeState::Healthy);
        assert_eq!(detector.state(&b), NodeState::Dead);
        assert_eq!(detector.state(&c), NodeState::Dead);

        detector.shutdown().await;
    }
}
