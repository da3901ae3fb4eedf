//! The consensus transport contract (spec.md §6, "Consensus transport").
//!
//! The core does not specify a wire encoding; any implementation that
//! preserves message boundaries and a reliable peer-to-peer channel
//! suffices. [`ChannelTransport`] is an in-process implementation (built on
//! `tokio::sync::mpsc`) good enough for tests and the `demos/` binary,
//! analogous in spirit to the teacher's "simple transport" stub, except it
//! actually delivers messages instead of being a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::Result;
use crate::types::NodeId;

use super::types::ConsensusMessage;

#[async_trait]
pub trait ConsensusTransport: Send + Sync + 'static {
    /// Dispatch a batch of outbound messages. Delivery is best-effort: a
    /// failure to reach one peer must not fail delivery to the others, and
    /// must not be fatal to the caller (see spec.md §6, peer heartbeat RPC
    /// semantics, which generalizes to all RPC sends: only the receiver's
    /// own liveness logic marks a peer down).
    async fn send(&self, messages: Vec<(NodeId, ConsensusMessage)>);

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

type Inbox = mpsc::UnboundedSender<ConsensusMessage>;

/// A shared in-process message hub. Each [`ConsensusNode`](super::ConsensusNode)
/// registers its inbox once at construction; [`ChannelTransport::send`] looks
/// up the destination and forwards directly.
#[derive(Clone, Default)]
pub struct ChannelHub {
    inboxes: Arc<AsyncMutex<HashMap<NodeId, Inbox>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id`'s inbox. `sender` is typically the same
    /// step-channel sender a [`super::ConsensusNode::spawn`] call returned,
    /// so that messages routed through the hub land directly in the node's
    /// own message loop rather than through an intermediate forwarding task.
    pub async fn register(&self, node_id: NodeId, sender: Inbox) {
        self.inboxes.lock().await.insert(node_id, sender);
    }

    pub async fn unregister(&self, node_id: &NodeId) {
        self.inboxes.lock().await.remove(node_id);
    }

    /// A transport handle scoped to one node's outbound traffic.
    pub fn transport_for(&self, node_id: NodeId) -> ChannelTransport {
        ChannelTransport { hub: self.clone(), node_id }
    }
}

pub struct ChannelTransport {
    hub: ChannelHub,
    #[allow(dead_code)]
    node_id: NodeId,
}

#[async_trait]
impl ConsensusTransport for ChannelTransport {
    async fn send(&self, messages: Vec<(NodeId, ConsensusMessage)>) {
        let inboxes = self.hub.inboxes.lock().await;
        for (to, msg) in messages {
            if let Some(inbox) = inboxes.get(&to) {
                // A full/closed peer inbox is the receiver's problem, not
                // ours: drop silently, matching the heartbeat RPC semantics
                // generalized to all consensus sends.
                let _ = inbox.send(msg);
            }
        }
    }
}

/// A transport with no peers, for single-node tests that never send.
pub struct NullTransport;

#[async_trait]
impl ConsensusTransport for NullTransport {
    async fn send(&self, _messages: Vec<(NodeId, ConsensusMessage)>) {}
}

