// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Ordering protocols.
//!
//! A protocol turns locally submitted transactions into entries of the
//! [`OrderedLog`], agreeing with the other nodes on a single total order. The
//! protocol is chosen at construction through [`OrderingMode`].

mod log;
mod mesh;
mod multi_leader;
mod proposal;
mod single_leader;

use std::sync::Arc;
use std::time::Duration;

use app_core::Transaction;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub(crate) use log::lock_storage;
pub use log::OrderedLog;
pub use mesh::{Envelope, Mesh, MeshTransport, NodeId, PeerMessage, PeerTransport, TransportError};
pub use multi_leader::MultiLeader;
pub use proposal::{Proposal, decided_order};
pub use single_leader::SingleLeader;

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("peer transport failed")]
    Transport {
        #[source]
        source: TransportError,
    },
    #[error("leader {leader} is unreachable")]
    LeaderUnreachable {
        leader: NodeId,
        #[source]
        source: TransportError,
    },
    #[error("ordering protocol is not started")]
    NotStarted,
    #[error("ordering protocol is already started")]
    AlreadyStarted,
    #[error("ordered log storage failed")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("ordering task stopped unexpectedly")]
    Stopped,
}

impl From<rusqlite::Error> for OrderingError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Storage { source }
    }
}

#[async_trait]
pub trait OrderingProtocol: Send + Sync {
    /// Joins the protocol and starts deciding into `log`.
    async fn start(&self, log: OrderedLog) -> Result<(), OrderingError>;

    /// Hands a durably accepted transaction to the protocol.
    async fn submit(&self, tx: Transaction) -> Result<(), OrderingError>;

    /// Flushes the decisions this node is responsible for and leaves.
    async fn stop(&self) -> Result<(), OrderingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingMode {
    SingleLeader {
        leader: NodeId,
        members: Vec<NodeId>,
        sync_interval: Duration,
    },
    MultiLeader {
        members: Vec<NodeId>,
        round_interval: Duration,
    },
}

impl OrderingMode {
    pub fn build(
        self,
        transport: Arc<dyn PeerTransport>,
        inbox: mpsc::Receiver<Envelope>,
    ) -> Arc<dyn OrderingProtocol> {
        match self {
            Self::SingleLeader {
                leader,
                members,
                sync_interval,
            } => Arc::new(SingleLeader::new(
                leader,
                members,
                sync_interval,
                transport,
                inbox,
            )),
            Self::MultiLeader {
                members,
                round_interval,
            } => Arc::new(MultiLeader::new(members, round_interval, transport, inbox)),
        }
    }
}
