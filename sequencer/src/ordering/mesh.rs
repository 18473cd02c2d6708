// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! In-process peer mesh used to wire ordering protocols together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use app_core::Transaction;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::proposal::Proposal;

pub type NodeId = u64;

const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Follower -> leader: please order this.
    Forward { tx: Transaction },
    /// Leader -> followers: `tx` sits at `seq`.
    Ordered { seq: u64, tx: Transaction },
    /// Follower -> leader: send me everything from `next_seq`.
    SyncRequest { next_seq: u64 },
    Proposal(Proposal),
    /// Ask a member for every proposal it holds from `since_round` on.
    ProposalRequest { since_round: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub message: PeerMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: NodeId },
    #[error("peer {peer} inbox is full")]
    Backpressure { peer: NodeId },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_id(&self) -> NodeId;

    async fn send(&self, to: NodeId, message: PeerMessage) -> Result<(), TransportError>;
}

/// Broker routing envelopes between [`MeshTransport`]s by node id.
#[derive(Clone, Debug)]
pub struct Mesh {
    peers: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Envelope>>>>,
    inbox_capacity: usize,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(inbox_capacity: usize) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Registers `id`, replacing any previous registration (a restarted node).
    pub fn join(&self, id: NodeId) -> (MeshTransport, mpsc::Receiver<Envelope>) {
        let (sender, inbox) = mpsc::channel(self.inbox_capacity);
        self.lock_peers().insert(id, sender);
        let transport = MeshTransport {
            local_id: id,
            mesh: self.clone(),
        };
        (transport, inbox)
    }

    pub fn leave(&self, id: NodeId) {
        self.lock_peers().remove(&id);
    }

    fn route(&self, to: NodeId) -> Option<mpsc::Sender<Envelope>> {
        self.lock_peers().get(&to).cloned()
    }

    fn lock_peers(&self) -> MutexGuard<'_, HashMap<NodeId, mpsc::Sender<Envelope>>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Debug)]
pub struct MeshTransport {
    local_id: NodeId,
    mesh: Mesh,
}

#[async_trait]
impl PeerTransport for MeshTransport {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    async fn send(&self, to: NodeId, message: PeerMessage) -> Result<(), TransportError> {
        let sender = self
            .mesh
            .route(to)
            .ok_or(TransportError::Unreachable { peer: to })?;
        let envelope = Envelope {
            from: self.local_id,
            message,
        };
        // Never block the caller's protocol task on a slow peer.
        sender.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Backpressure { peer: to },
            TrySendError::Closed(_) => TransportError::Unreachable { peer: to },
        })
    }
}
