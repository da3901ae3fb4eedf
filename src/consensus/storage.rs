//! The storage contract (spec.md §4.1): append entries, set hard-state,
//! apply snapshot, read a range of entries, read initial state. Durability
//! is the implementation's responsibility; the node only reports an entry
//! persisted once this trait's methods return `Ok`.

use std::ops::Range;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result, DOMAIN_CONSENSUS};

use super::types::{HardState, InitialState, LogEntry, Snapshot};

#[async_trait]
pub trait ConsensusStorage: Send + Sync + 'static {
    /// Persist `hard_state`. Errors here are fatal (spec.md §4.1 "Failure
    /// semantics").
    async fn save_hard_state(&self, hard_state: &HardState) -> Result<()>;

    /// Append `entries`, truncating any stored tail whose index is >= the
    /// first new entry's index. A gap between the stored tail and the new
    /// head is a fatal invariant violation.
    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Read entries in `range` (half-open on index).
    async fn entries(&self, range: Range<u64>) -> Result<Vec<LogEntry>>;

    /// Drop all entries with index <= `index`, used after a snapshot install.
    async fn truncate_prefix(&self, index: u64) -> Result<()>;

    /// Install a snapshot, replacing any state the log otherwise implies.
    /// "Snapshot-temporarily-unavailable" is signalled by returning
    /// `Error::Unavailable`; any other error is fatal.
    async fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// What a freshly-started node needs to resume correctly.
    async fn initial_state(&self) -> Result<InitialState>;

    /// Applying the same snapshot twice must be a no-op (spec.md §8).
    async fn current_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// An in-memory `ConsensusStorage`, the equivalent of the teacher's
/// `memstore` crate: suitable for tests and the `demos/` binary, not for a
/// real deployment (nothing here survives a restart).
#[derive(Default)]
pub struct MemConsensusStorage {
    inner: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemConsensusStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsensusStorage for MemConsensusStorage {
    async fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if hard_state.current_term < state.hard_state.current_term {
            return Err(Error::internal(
                DOMAIN_CONSENSUS,
                "hard-state term must be non-decreasing",
            ));
        }
        state.hard_state = hard_state.clone();
        Ok(())
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.inner.lock().unwrap();
        let new_first = entries[0].index;
        let stored_next = state.entries.last().map(|e| e.index + 1).unwrap_or_else(|| {
            state.snapshot.as_ref().map(|s| s.meta.index + 1).unwrap_or(1)
        });
        if new_first > stored_next {
            return Err(Error::internal(
                DOMAIN_CONSENSUS,
                format!("log gap: stored tail {} new head {}", stored_next, new_first),
            ));
        }
        state.entries.retain(|e| e.index < new_first);
        state.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn entries(&self, range: Range<u64>) -> Result<Vec<LogEntry>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| range.contains(&e.index))
            .cloned()
            .collect())
    }

    async fn truncate_prefix(&self, index: u64) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.entries.retain(|e| e.index > index);
        Ok(())
    }

    async fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(existing) = &state.snapshot {
            if existing.meta.index == snapshot.meta.index && existing.meta.term == snapshot.meta.term {
                return Ok(());
            }
        }
        state.entries.retain(|e| e.index > snapshot.meta.index);
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn initial_state(&self) -> Result<InitialState> {
        let state = self.inner.lock().unwrap();
        let (last_log_index, last_log_term) = state
            .entries
            .last()
            .map(|e| (e.index, e.term))
            .or_else(|| state.snapshot.as_ref().map(|s| (s.meta.index, s.meta.term)))
            .unwrap_or((0, 0));
        Ok(InitialState {
            hard_state: state.hard_state.clone(),
            last_log_index,
            last_log_term,
            membership: state.snapshot.as_ref().map(|s| s.meta.membership.clone()).unwrap_or_default(),
        })
    }

    async fn current_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.inner.lock().unwrap().snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_truncates_conflicting_tail() {
        let storage = MemConsensusStorage::new();
        let e = |i, t| LogEntry { term: t, index: i, payload: super::super::types::EntryPayload::Blank };
        storage.append_entries(&[e(1, 1), e(2, 1), e(3, 1)]).await.unwrap();
        storage.append_entries(&[e(2, 2)]).await.unwrap();
        let entries = storage.entries(0..10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].term, 2);
    }

    #[tokio::test]
    async fn append_rejects_gap() {
        let storage = MemConsensusStorage::new();
        let e = |i, t| LogEntry { term: t, index: i, payload: super::super::types::EntryPayload::Blank };
        storage.append_entries(&[e(1, 1)]).await.unwrap();
        let result = storage.append_entries(&[e(5, 1)]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn snapshot_apply_is_idempotent() {
        let storage = MemConsensusStorage::new();
        let snap = Snapshot {
            meta: super::super::types::SnapshotMeta { index: 5, term: 1, membership: vec![] },
            data: vec![1, 2, 3],
        };
        storage.apply_snapshot(&snap).await.unwrap();
        storage.apply_snapshot(&snap).await.unwrap();
        assert_eq!(storage.current_snapshot().await.unwrap().unwrap().meta.index, 5);
    }
}
