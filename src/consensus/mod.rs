//! C1: the consensus core. A pluggable-storage, pluggable-transport
//! replicated log with leader election, membership changes and snapshot
//! installation, per spec.md §4.1.

mod node;
mod storage;
mod transport;
mod types;

pub use node::ConsensusNode;
pub use storage::{ConsensusStorage, MemConsensusStorage};
pub use transport::{ChannelHub, ChannelTransport, ConsensusTransport, NullTransport};
pub use types::{
    Applied, AppendEntriesRequest, AppendEntriesResponse, ConfChange, ConsensusMessage,
    ConsensusMetrics, EntryPayload, HardState, InitialState, InstallSnapshotRequest,
    InstallSnapshotResponse, LogEntry, Role, Snapshot, SnapshotMeta, VoteRequest, VoteResponse,
};
