//! Wire types for the consensus core: log entries, hard state, snapshots and
//! the inter-peer message set.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A membership change, the only structured payload a [`super::ConsensusNode`]
/// interprets itself; everything else is an opaque application command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfChange {
    AddPeer(NodeId),
    RemovePeer(NodeId),
}

/// The two entry kinds described in spec.md §3 ("ConsensusEntry"): a normal
/// application command, or a conf-change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    Normal(Vec<u8>),
    ConfChange(ConfChange),
    /// A blank entry committed by a new leader on taking office, so that it
    /// can establish commitment of prior-term entries (§5.4.2 of the Raft
    /// paper). Never surfaced on the applied stream.
    Blank,
}

/// One entry in the replicated log, carrying the (term, index) coordinates
/// assigned by the consensus node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// A peer's locally persisted hard state: the durable fields that must
/// survive a restart for safety.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Metadata describing a snapshot, sufficient to resume replication from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub membership: Vec<NodeId>,
}

/// An application-level snapshot: opaque bytes plus the metadata needed to
/// install it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// What storage reports back on startup (`get_initial_state` in spec.md's
/// storage contract).
#[derive(Debug, Clone, Default)]
pub struct InitialState {
    pub hard_state: HardState,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub membership: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// The index of the last entry this follower now has, used by the
    /// leader to advance `match_index` without a back-off search when
    /// `success` is true, or to jump back when it's false.
    pub last_log_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Every message a peer may receive, fed to [`super::ConsensusNode::step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Vote(VoteRequest),
    VoteResponse { from: NodeId, resp: VoteResponse },
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse { from: NodeId, resp: AppendEntriesResponse },
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse { from: NodeId, resp: InstallSnapshotResponse },
}

/// An item delivered on the `applied_stream`.
#[derive(Debug, Clone)]
pub enum Applied {
    Normal { term: u64, index: u64, payload: Vec<u8> },
    ConfChange { term: u64, index: u64, change: ConfChange },
    Snapshot { term: u64, index: u64, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A cheap, defensively-copied point-in-time view of the node (see
/// SPEC_FULL.md §2's supplement).
#[derive(Debug, Clone)]
pub struct ConsensusMetrics {
    pub term: u64,
    pub role: Role,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self { term: 0, role: Role::Follower, last_log_index: 0, commit_index: 0, is_leader: false, leader_id: None }
    }
}
