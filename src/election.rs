//! C3: a thin semantic layer over the consensus node (spec.md §4.3) —
//! stable "who is leader" value, last-election timestamp, and add/remove-peer
//! plumbing into conf-change proposals.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::consensus::{ConfChange, ConsensusNode};
use crate::error::{Error, Result, DOMAIN_CLUSTER};
use crate::types::{unix_now, NodeId};

const LEADER_CHANGES_CAPACITY: usize = 10;

struct State {
    current_leader: NodeId,
    last_election_time: u64,
}

/// Wraps a [`ConsensusNode`], deriving a stable leadership view from its
/// `leader_stream`.
pub struct ElectionManager {
    self_id: NodeId,
    node: ConsensusNode,
    state: RwLock<State>,
    leader_changes_tx: broadcast::Sender<NodeId>,
    listener: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ElectionManager {
    pub fn new(self_id: NodeId, node: ConsensusNode) -> Arc<Self> {
        let (leader_changes_tx, _) = broadcast::channel(LEADER_CHANGES_CAPACITY);
        Arc::new(Self {
            self_id,
            node,
            state: RwLock::new(State { current_leader: NodeId::new(""), last_election_time: 0 }),
            leader_changes_tx,
            listener: AsyncMutex::new(None),
        })
    }

    /// Start listening on the consensus node's `leader_stream`, translating
    /// edges into leadership state and `leader_changes` events.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            return Err(Error::already_exists(DOMAIN_CLUSTER, "election manager already started"));
        }
        let mut stream = self.node.leader_stream().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(leading) = stream.next().await {
                this.on_leader_edge(leading).await;
            }
        });
        *guard = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn on_leader_edge(&self, became_leader: bool) {
        let mut state = self.state.write().await;
        if became_leader {
            state.current_leader = self.self_id.clone();
            state.last_election_time = unix_now();
            let leader = state.current_leader.clone();
            drop(state);
            let _ = self.leader_changes_tx.send(leader);
        } else {
            state.current_leader = NodeId::new("");
            drop(state);
            let _ = self.leader_changes_tx.send(NodeId::new(""));
        }
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub async fn current_leader(&self) -> NodeId {
        self.state.read().await.current_leader.clone()
    }

    pub async fn last_election_time(&self) -> u64 {
        self.state.read().await.last_election_time
    }

    /// Lazy stream of leader changes. New leader id, or empty string for
    /// "leader unknown / we just stepped down".
    pub fn leader_changes(&self) -> BroadcastStream<NodeId> {
        BroadcastStream::new(self.leader_changes_tx.subscribe())
    }

    pub async fn add_peer(&self, id: NodeId) -> Result<()> {
        if id.is_empty() {
            return Err(Error::invalid_argument(DOMAIN_CLUSTER, "peer id must be non-empty"));
        }
        if !self.node.is_leader() {
            return Err(Error::failed_precondition(DOMAIN_CLUSTER, "add_peer requires the current node to be leader"));
        }
        if !self.node.propose_conf_change(ConfChange::AddPeer(id)) {
            return Err(Error::unavailable(DOMAIN_CLUSTER, "consensus node is shutting down"));
        }
        Ok(())
    }

    pub async fn remove_peer(&self, id: NodeId) -> Result<()> {
        if id.is_empty() {
            return Err(Error::invalid_argument(DOMAIN_CLUSTER, "peer id must be non-empty"));
        }
        if !self.node.is_leader() {
            return Err(Error::failed_precondition(DOMAIN_CLUSTER, "remove_peer requires the current node to be leader"));
        }
        if !self.node.propose_conf_change(ConfChange::RemovePeer(id)) {
            return Err(Error::unavailable(DOMAIN_CLUSTER, "consensus node is shutting down"));
        }
        Ok(())
    }

    /// Advisory: nudge the consensus node's election timer to expire soon.
    pub fn trigger_election(&self) {
        self.node.trigger_election();
    }
}
