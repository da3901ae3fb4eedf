//! The consensus node (C1): ordered, fault-tolerant log replication exposing
//! the proposal API, applied-entry stream, and leadership signal described in
//! spec.md §4.1.
//!
//! Implementation note: this is a from-scratch, single-task engine rather
//! than a binding to an external crate — the spec's non-goal is about not
//! *specifying the on-disk log format*, which stays entirely a property of
//! the pluggable [`ConsensusStorage`]; the replication algorithm above it is
//! still this crate's to build, in the idiom the pack's async-raft-shaped
//! reference material uses: one long-lived task per node, `tokio::sync`
//! channels at every public seam, `tracing::instrument` on the async
//! entry points.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_futures::Instrument;

use crate::config::ClusterConfig;
use crate::error::{Error, Result, DOMAIN_CONSENSUS};
use crate::types::NodeId;

use super::storage::ConsensusStorage;
use super::transport::ConsensusTransport;
use super::types::{
    Applied, AppendEntriesRequest, AppendEntriesResponse, ConfChange, ConsensusMessage,
    ConsensusMetrics, EntryPayload, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    Role, VoteRequest, VoteResponse,
};

const TICK_PERIOD: Duration = Duration::from_millis(50);

enum ApiMsg {
    Propose(Vec<u8>),
    ProposeConfChange(ConfChange),
    ResetElectionTimer,
}

struct Shared {
    id: NodeId,
    is_leader: AtomicBool,
    metrics_rx: watch::Receiver<ConsensusMetrics>,
    tx_api: mpsc::UnboundedSender<ApiMsg>,
    tx_step: mpsc::UnboundedSender<ConsensusMessage>,
    applied_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Applied>>>,
    leader_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<bool>>>,
    tx_shutdown: AsyncMutex<Option<oneshot::Sender<()>>>,
    join: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Public, cheaply-cloneable handle to a running consensus node.
#[derive(Clone)]
pub struct ConsensusNode {
    shared: Arc<Shared>,
}

impl ConsensusNode {
    /// Spawn a node. Returns the handle plus the raw step-message sender:
    /// register the latter with whatever [`ConsensusTransport`] delivers
    /// inbound messages for this node id (e.g.
    /// [`super::transport::ChannelHub::register`]) — this is the moral
    /// equivalent of a transport's "receive callback" invoking `step`.
    pub fn spawn<S, T>(
        id: NodeId,
        config: Arc<ClusterConfig>,
        storage: Arc<S>,
        transport: Arc<T>,
    ) -> (Self, mpsc::UnboundedSender<ConsensusMessage>)
    where
        S: ConsensusStorage,
        T: ConsensusTransport,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_step, rx_step) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(ConsensusMetrics::default());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let is_leader = Arc::new(AtomicBool::new(false));
        let engine = Engine {
            id: id.clone(),
            config,
            storage,
            transport,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            membership: BTreeSet::new(),
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            leader_id: None,
            last_leader_emit: None,
            election_deadline: Instant::now(),
            last_heartbeat_sent: Instant::now(),
            votes_received: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            applied_tx,
            leader_tx,
            metrics_tx,
            is_leader: is_leader.clone(),
        };

        let span = tracing::debug_span!("consensus_node", node = %id);
        let join = tokio::spawn(engine.run(rx_api, rx_step, rx_shutdown).instrument(span));

        let shared = Arc::new(Shared {
            id,
            is_leader,
            metrics_rx,
            tx_api,
            tx_step: tx_step.clone(),
            applied_rx: AsyncMutex::new(Some(applied_rx)),
            leader_rx: AsyncMutex::new(Some(leader_rx)),
            tx_shutdown: AsyncMutex::new(Some(tx_shutdown)),
            join: AsyncMutex::new(Some(join)),
        });

        (Self { shared }, tx_step)
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    /// Enqueue a normal entry. Returns `false` only if the node is shutting
    /// down; acceptance does not imply this node is leader, nor that the
    /// entry will ever reach the applied stream (spec.md §8, two-of-three
    /// quorum loss scenario).
    pub fn propose(&self, payload: Vec<u8>) -> bool {
        self.shared.tx_api.send(ApiMsg::Propose(payload)).is_ok()
    }

    /// Enqueue a membership change. Same acceptance semantics as [`propose`](Self::propose).
    pub fn propose_conf_change(&self, change: ConfChange) -> bool {
        self.shared.tx_api.send(ApiMsg::ProposeConfChange(change)).is_ok()
    }

    /// Feed an inbound consensus message from a peer.
    pub fn step(&self, msg: ConsensusMessage) {
        let _ = self.shared.tx_step.send(msg);
    }

    /// Advisory: nudge the local election timer to expire soon. No
    /// correctness guarantee that a new election will occur.
    pub fn trigger_election(&self) {
        let _ = self.shared.tx_api.send(ApiMsg::ResetElectionTimer);
    }

    /// Best-effort, racy-against-`leader_stream` view of current leadership.
    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::Relaxed)
    }

    /// Cheap, defensively-copied point-in-time view.
    pub fn metrics(&self) -> ConsensusMetrics {
        self.shared.metrics_rx.borrow().clone()
    }

    /// A lazy, finite-on-shutdown sequence of applied entries. Must only be
    /// taken once; a second call panics.
    pub async fn applied_stream(&self) -> UnboundedReceiverStream<Applied> {
        let rx = self
            .shared
            .applied_rx
            .lock()
            .await
            .take()
            .expect("applied_stream already taken");
        UnboundedReceiverStream::new(rx)
    }

    /// A lazy sequence of boolean leadership edges for this node. Must only
    /// be taken once.
    pub async fn leader_stream(&self) -> UnboundedReceiverStream<bool> {
        let rx = self
            .shared
            .leader_rx
            .lock()
            .await
            .take()
            .expect("leader_stream already taken");
        UnboundedReceiverStream::new(rx)
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shared.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.shared.join.lock().await.take() {
            let _ = handle.await;
        }
    }
}

struct Engine<S, T> {
    id: NodeId,
    config: Arc<ClusterConfig>,
    storage: Arc<S>,
    transport: Arc<T>,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    membership: BTreeSet<NodeId>,

    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
    last_log_term: u64,

    leader_id: Option<NodeId>,
    last_leader_emit: Option<bool>,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,
    votes_received: BTreeSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,

    applied_tx: mpsc::UnboundedSender<Applied>,
    leader_tx: mpsc::UnboundedSender<bool>,
    metrics_tx: watch::Sender<ConsensusMetrics>,
    is_leader: Arc<AtomicBool>,
}

impl<S: ConsensusStorage, T: ConsensusTransport> Engine<S, T> {
    async fn run(
        mut self,
        mut rx_api: mpsc::UnboundedReceiver<ApiMsg>,
        mut rx_step: mpsc::UnboundedReceiver<ConsensusMessage>,
        mut rx_shutdown: oneshot::Receiver<()>,
    ) {
        if let Err(e) = self.bootstrap().await {
            tracing::error!(node = %self.id, error = %e, "consensus node failed to bootstrap, halting");
            return;
        }

        let mut ticker = tokio::time::interval(TICK_PERIOD);
        loop {
            tokio::select! {
                _ = &mut rx_shutdown => {
                    tracing::info!(node = %self.id, "consensus node shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        tracing::error!(node = %self.id, error = %e, "fatal error on tick, halting");
                        break;
                    }
                }
                Some(msg) = rx_step.recv() => {
                    if let Err(e) = self.handle_message(msg).await {
                        tracing::error!(node = %self.id, error = %e, "fatal error handling message, halting");
                        break;
                    }
                }
                Some(api) = rx_api.recv() => {
                    if let Err(e) = self.handle_api(api).await {
                        tracing::error!(node = %self.id, error = %e, "fatal error handling api call, halting");
                        break;
                    }
                }
                else => break,
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<()> {
        let initial = self.storage.initial_state().await?;
        self.current_term = initial.hard_state.current_term;
        self.voted_for = initial.hard_state.voted_for;
        self.last_log_index = initial.last_log_index;
        self.last_log_term = initial.last_log_term;
        self.commit_index = 0;
        self.last_applied = 0;

        self.membership = if !initial.membership.is_empty() {
            initial.membership.into_iter().collect()
        } else {
            self.config.voting_members().into_iter().collect()
        };

        if self.last_log_index > 0 {
            self.log = self.storage.entries(1..self.last_log_index + 1).await?;
        }

        self.election_deadline = Instant::now() + self.rand_election_timeout();
        self.publish_metrics();

        if self.membership.len() == 1 && self.membership.contains(&self.id) {
            self.become_leader().await?;
        }
        Ok(())
    }

    fn rand_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    async fn on_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.role {
            Role::Leader => {
                if now >= self.last_heartbeat_sent + self.config.heartbeat_interval {
                    self.last_heartbeat_sent = now;
                    self.replicate_to_all().await;
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.become_candidate().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_api(&mut self, api: ApiMsg) -> Result<()> {
        match api {
            ApiMsg::Propose(payload) => {
                if self.role == Role::Leader {
                    self.append_local_entry(EntryPayload::Normal(payload)).await?;
                    self.replicate_to_all().await;
                }
            }
            ApiMsg::ProposeConfChange(change) => {
                if self.role == Role::Leader {
                    self.append_local_entry(EntryPayload::ConfChange(change)).await?;
                    self.replicate_to_all().await;
                }
            }
            ApiMsg::ResetElectionTimer => {
                if self.role != Role::Leader {
                    self.election_deadline = Instant::now();
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: ConsensusMessage) -> Result<()> {
        match msg {
            ConsensusMessage::Vote(req) => self.handle_vote_request(req).await?,
            ConsensusMessage::VoteResponse { from, resp } => {
                self.handle_vote_response(from, resp).await?
            }
            ConsensusMessage::AppendEntries(req) => self.handle_append_entries(req).await?,
            ConsensusMessage::AppendEntriesResponse { from, resp } => {
                self.handle_append_entries_response(from, resp).await?
            }
            ConsensusMessage::InstallSnapshot(req) => self.handle_install_snapshot(req).await?,
            ConsensusMessage::InstallSnapshotResponse { from, resp } => {
                self.handle_install_snapshot_response(from, resp).await?
            }
        }
        Ok(())
    }

    // -- role transitions ---------------------------------------------------

    async fn become_follower(&mut self, term: u64, leader_hint: Option<NodeId>) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.save_hard_state().await?;
        }
        self.role = Role::Follower;
        if leader_hint.is_some() {
            self.leader_id = leader_hint;
        }
        self.emit_leader_edge(false);
        self.publish_metrics();
        Ok(())
    }

    async fn become_candidate(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes_received = BTreeSet::new();
        self.votes_received.insert(self.id.clone());
        self.election_deadline = Instant::now() + self.rand_election_timeout();
        self.save_hard_state().await?;
        self.emit_leader_edge(false);
        self.publish_metrics();

        if self.has_majority(self.votes_received.len()) {
            return self.become_leader().await;
        }

        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        };
        let messages = self
            .membership
            .iter()
            .filter(|p| **p != self.id)
            .map(|p| (p.clone(), ConsensusMessage::Vote(req.clone())))
            .collect();
        self.transport.send(messages).await;
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.membership.iter().filter(|p| **p != self.id) {
            self.next_index.insert(peer.clone(), self.last_log_index + 1);
            self.match_index.insert(peer.clone(), 0);
        }
        self.emit_leader_edge(true);
        // A blank no-op entry establishes commitment of prior terms (Raft §5.4.2).
        self.append_local_entry(EntryPayload::Blank).await?;
        // Force an immediate heartbeat/replication burst on the next tick.
        self.last_heartbeat_sent = Instant::now() - self.config.heartbeat_interval;
        self.publish_metrics();
        Ok(())
    }

    fn emit_leader_edge(&mut self, leading: bool) {
        if self.last_leader_emit != Some(leading) {
            self.last_leader_emit = Some(leading);
            self.is_leader.store(leading, Ordering::Relaxed);
            let _ = self.leader_tx.send(leading);
        }
    }

    fn has_majority(&self, count: usize) -> bool {
        count * 2 > self.membership.len()
    }

    // -- log bookkeeping ------------------------------------------------------

    async fn save_hard_state(&self) -> Result<()> {
        let hs = super::types::HardState { current_term: self.current_term, voted_for: self.voted_for.clone() };
        self.storage.save_hard_state(&hs).await
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.log.iter().find(|e| e.index == index).map(|e| e.term).unwrap_or(0)
    }

    async fn append_local_entry(&mut self, payload: EntryPayload) -> Result<()> {
        let entry = LogEntry { term: self.current_term, index: self.last_log_index + 1, payload };
        self.storage.append_entries(std::slice::from_ref(&entry)).await?;
        self.last_log_index = entry.index;
        self.last_log_term = entry.term;
        self.log.push(entry);

        if self.role == Role::Leader {
            self.match_index.insert(self.id.clone(), self.last_log_index);
            if self.membership.len() == 1 {
                self.advance_commit_index();
                self.apply_committed().await?;
            }
        }
        Ok(())
    }

    fn advance_commit_index(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = self
            .membership
            .iter()
            .map(|p| if *p == self.id { self.last_log_index } else { *self.match_index.get(p).unwrap_or(&0) })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let majority_idx = self.membership.len() / 2;
        let candidate = matched[majority_idx];
        if candidate > self.commit_index && self.term_at(candidate) == self.current_term {
            self.commit_index = candidate;
        }
    }

    async fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = match self.log.iter().find(|e| e.index == next) {
                Some(e) => e.clone(),
                None => {
                    return Err(Error::internal(
                        DOMAIN_CONSENSUS,
                        format!("gap in log at index {}: cannot apply committed entry", next),
                    ))
                }
            };
            match &entry.payload {
                EntryPayload::Normal(payload) => {
                    let _ = self.applied_tx.send(Applied::Normal {
                        term: entry.term,
                        index: entry.index,
                        payload: payload.clone(),
                    });
                }
                EntryPayload::ConfChange(change) => {
                    self.apply_conf_change(change.clone());
                    let _ = self.applied_tx.send(Applied::ConfChange {
                        term: entry.term,
                        index: entry.index,
                        change: change.clone(),
                    });
                }
                EntryPayload::Blank => {}
            }
            self.last_applied = next;
        }
        self.publish_metrics();
        Ok(())
    }

    fn apply_conf_change(&mut self, change: ConfChange) {
        match change {
            ConfChange::AddPeer(peer) => {
                if self.membership.insert(peer.clone()) && self.role == Role::Leader {
                    self.next_index.insert(peer.clone(), self.last_log_index + 1);
                    self.match_index.insert(peer, 0);
                }
            }
            ConfChange::RemovePeer(peer) => {
                self.membership.remove(&peer);
                self.next_index.remove(&peer);
                self.match_index.remove(&peer);
            }
        }
    }

    fn publish_metrics(&self) {
        let metrics = ConsensusMetrics {
            term: self.current_term,
            role: self.role,
            last_log_index: self.last_log_index,
            commit_index: self.commit_index,
            is_leader: self.role == Role::Leader,
            leader_id: self.leader_id.clone(),
        };
        let _ = self.metrics_tx.send(metrics);
    }

    // -- replication ----------------------------------------------------------

    async fn replicate_to_all(&mut self) {
        let peers: Vec<NodeId> = self.membership.iter().filter(|p| **p != self.id).cloned().collect();
        let mut messages = Vec::with_capacity(peers.len());
        for peer in peers {
            let next = *self.next_index.get(&peer).unwrap_or(&(self.last_log_index + 1));
            let prev_index = next.saturating_sub(1);
            let prev_term = self.term_at(prev_index);
            let entries: Vec<LogEntry> = self.log.iter().filter(|e| e.index >= next).cloned().collect();
            let req = AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.id.clone(),
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            };
            messages.push((peer, ConsensusMessage::AppendEntries(req)));
        }
        self.transport.send(messages).await;
    }

    async fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Result<()> {
        if req.term < self.current_term {
            self.send_append_response(&req.leader_id, false).await;
            return Ok(());
        }
        if req.term > self.current_term || self.role != Role::Follower {
            self.become_follower(req.term, Some(req.leader_id.clone())).await?;
        } else {
            self.leader_id = Some(req.leader_id.clone());
        }
        self.election_deadline = Instant::now() + self.rand_election_timeout();

        if req.prev_log_index > 0 {
            let have_term = self.term_at(req.prev_log_index);
            if req.prev_log_index > self.last_log_index || have_term != req.prev_log_term {
                self.send_append_response(&req.leader_id, false).await;
                return Ok(());
            }
        }

        if !req.entries.is_empty() {
            self.storage.append_entries(&req.entries).await?;
            let first_new = req.entries[0].index;
            self.log.retain(|e| e.index < first_new);
            self.log.extend(req.entries.iter().cloned());
            let last = req.entries.last().unwrap();
            self.last_log_index = last.index;
            self.last_log_term = last.term;
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_log_index);
            self.apply_committed().await?;
        }

        self.send_append_response(&req.leader_id, true).await;
        Ok(())
    }

    async fn send_append_response(&mut self, to: &NodeId, success: bool) {
        let resp = AppendEntriesResponse { term: self.current_term, success, last_log_index: self.last_log_index };
        self.transport
            .send(vec![(to.clone(), ConsensusMessage::AppendEntriesResponse { from: self.id.clone(), resp })])
            .await;
    }

    async fn handle_append_entries_response(&mut self, from: NodeId, resp: AppendEntriesResponse) -> Result<()> {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None).await?;
            return Ok(());
        }
        if self.role != Role::Leader {
            return Ok(());
        }
        if resp.success {
            self.match_index.insert(from.clone(), resp.last_log_index);
            self.next_index.insert(from, resp.last_log_index + 1);
            self.advance_commit_index();
            self.apply_committed().await?;
        } else {
            let backoff = resp.last_log_index + 1;
            self.next_index.insert(from, backoff.max(1));
        }
        Ok(())
    }

    async fn handle_vote_request(&mut self, req: VoteRequest) -> Result<()> {
        if req.term < self.current_term {
            self.reply_vote(&req.candidate_id, false).await;
            return Ok(());
        }
        if req.term > self.current_term {
            self.become_follower(req.term, None).await?;
        }

        let log_ok = req.last_log_term > self.last_log_term
            || (req.last_log_term == self.last_log_term && req.last_log_index >= self.last_log_index);
        let can_vote = match &self.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };

        if log_ok && can_vote {
            self.voted_for = Some(req.candidate_id.clone());
            self.save_hard_state().await?;
            self.election_deadline = Instant::now() + self.rand_election_timeout();
            self.reply_vote(&req.candidate_id, true).await;
        } else {
            self.reply_vote(&req.candidate_id, false).await;
        }
        Ok(())
    }

    async fn reply_vote(&mut self, to: &NodeId, granted: bool) {
        let resp = VoteResponse { term: self.current_term, vote_granted: granted };
        self.transport
            .send(vec![(to.clone(), ConsensusMessage::VoteResponse { from: self.id.clone(), resp })])
            .await;
    }

    async fn handle_vote_response(&mut self, from: NodeId, resp: VoteResponse) -> Result<()> {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None).await?;
            return Ok(());
        }
        if self.role != Role::Candidate || resp.term != self.current_term || !resp.vote_granted {
            return Ok(());
        }
        self.votes_received.insert(from);
        if self.has_majority(self.votes_received.len()) {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> Result<()> {
        if req.term < self.current_term {
            return Ok(());
        }
        if req.term > self.current_term || self.role != Role::Follower {
            self.become_follower(req.term, Some(req.leader_id.clone())).await?;
        }
        self.election_deadline = Instant::now() + self.rand_election_timeout();

        match self.storage.apply_snapshot(&req.snapshot).await {
            Ok(()) => {
                self.log.retain(|e| e.index > req.snapshot.meta.index);
                self.last_log_index = self.last_log_index.max(req.snapshot.meta.index);
                self.last_log_term = req.snapshot.meta.term;
                self.commit_index = self.commit_index.max(req.snapshot.meta.index);
                self.last_applied = self.last_applied.max(req.snapshot.meta.index);
                let _ = self.applied_tx.send(Applied::Snapshot {
                    term: req.snapshot.meta.term,
                    index: req.snapshot.meta.index,
                    data: req.snapshot.data.clone(),
                });
            }
            Err(e) if !matches!(e, Error::Internal { .. }) => {
                tracing::warn!(node = %self.id, error = %e, "snapshot temporarily unavailable, will retry");
            }
            Err(e) => return Err(e),
        }

        let resp = InstallSnapshotResponse { term: self.current_term };
        self.transport
            .send(vec![(
                req.leader_id,
                ConsensusMessage::InstallSnapshotResponse { from: self.id.clone(), resp },
            )])
            .await;
        Ok(())
    }

    async fn handle_install_snapshot_response(&mut self, from: NodeId, resp: InstallSnapshotResponse) -> Result<()> {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None).await?;
            return Ok(());
        }
        if self.role == Role::Leader {
            if let Some(snapshot) = self.storage.current_snapshot().await?.as_ref() {
                self.match_index.insert(from.clone(), snapshot.meta.index);
                self.next_index.insert(from, snapshot.meta.index + 1);
            }
        }
        Ok(())
    }
}
