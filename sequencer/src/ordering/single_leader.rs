// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use app_core::Transaction;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Envelope, NodeId, OrderedLog, OrderingError, OrderingProtocol, PeerMessage, PeerTransport,
    TransportError,
};

const SUBMISSION_QUEUE_CAPACITY: usize = 1024;
const SYNC_PAGE_SIZE: usize = 256;

/// One node decides, everybody else mirrors.
///
/// The leader appends every transaction it sees to its ordered log and then
/// broadcasts `Ordered { seq, tx }`. Followers forward their writes to the
/// leader and persist `Ordered` entries strictly contiguously, asking for a
/// resync whenever they notice a gap (and on every `sync_interval` tick).
pub struct SingleLeader {
    leader: NodeId,
    members: Vec<NodeId>,
    sync_interval: Duration,
    transport: Arc<dyn PeerTransport>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    submissions: mpsc::Sender<Transaction>,
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<Envelope>>,
}

#[derive(Clone)]
struct Node {
    local_id: NodeId,
    leader: NodeId,
    members: Vec<NodeId>,
    transport: Arc<dyn PeerTransport>,
    log: OrderedLog,
}

impl SingleLeader {
    pub fn new(
        leader: NodeId,
        members: Vec<NodeId>,
        sync_interval: Duration,
        transport: Arc<dyn PeerTransport>,
        inbox: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            leader,
            members,
            sync_interval: sync_interval.max(Duration::from_millis(1)),
            transport,
            inbox: Mutex::new(Some(inbox)),
            running: Mutex::new(None),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.transport.local_id() == self.leader
    }

    async fn join_leader(&self, log: &OrderedLog) -> Result<u64, OrderingError> {
        let next_seq = log.next_seq()?;
        if self.is_leader() {
            return Ok(next_seq);
        }
        match self
            .transport
            .send(self.leader, PeerMessage::SyncRequest { next_seq })
            .await
        {
            Ok(()) => Ok(next_seq),
            Err(TransportError::Backpressure { .. }) => {
                warn!(leader = self.leader, "leader inbox full while joining");
                Ok(next_seq)
            }
            Err(source) => Err(OrderingError::LeaderUnreachable {
                leader: self.leader,
                source,
            }),
        }
    }
}

#[async_trait]
impl OrderingProtocol for SingleLeader {
    async fn start(&self, log: OrderedLog) -> Result<(), OrderingError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(OrderingError::AlreadyStarted);
        }
        let Some(inbox) = self.inbox.lock().await.take() else {
            return Err(OrderingError::Stopped);
        };

        let next_seq = match self.join_leader(&log).await {
            Ok(next_seq) => next_seq,
            Err(err) => {
                *self.inbox.lock().await = Some(inbox);
                return Err(err);
            }
        };

        let node = Node {
            local_id: self.transport.local_id(),
            leader: self.leader,
            members: self.members.clone(),
            transport: self.transport.clone(),
            log,
        };
        let (submissions, submission_rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = if self.is_leader() {
            info!(node = node.local_id, next_seq, "single-leader ordering started as leader");
            tokio::spawn(run_leader(node, submission_rx, inbox, cancel.clone()))
        } else {
            info!(
                node = node.local_id,
                leader = node.leader,
                next_seq,
                "single-leader ordering started as follower"
            );
            tokio::spawn(run_follower(
                node,
                next_seq,
                self.sync_interval,
                submission_rx,
                inbox,
                cancel.clone(),
            ))
        };

        *running = Some(Running {
            submissions,
            cancel,
            handle,
        });
        Ok(())
    }

    async fn submit(&self, tx: Transaction) -> Result<(), OrderingError> {
        let submissions = match self.running.lock().await.as_ref() {
            Some(running) => running.submissions.clone(),
            None => return Err(OrderingError::NotStarted),
        };
        submissions
            .send(tx)
            .await
            .map_err(|_| OrderingError::Stopped)
    }

    async fn stop(&self) -> Result<(), OrderingError> {
        let mut running = self.running.lock().await;
        let Some(active) = running.as_mut() else {
            return Err(OrderingError::NotStarted);
        };
        active.cancel.cancel();
        // The task stays registered until joined, so a dropped stop can be retried.
        let joined = (&mut active.handle).await;
        *running = None;
        let inbox = joined.map_err(|_| OrderingError::Stopped)?;
        *self.inbox.lock().await = Some(inbox);
        Ok(())
    }
}

async fn run_leader(
    node: Node,
    mut submissions: mpsc::Receiver<Transaction>,
    mut inbox: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Envelope> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(tx) = submissions.recv() => node.order(tx).await,
            Some(envelope) = inbox.recv() => node.on_leader_message(envelope).await,
        }
    }

    // Writes already handed to us are ours to decide before leaving.
    let mut flushed = 0_usize;
    while let Ok(tx) = submissions.try_recv() {
        node.order(tx).await;
        flushed += 1;
    }
    while let Ok(envelope) = inbox.try_recv() {
        if let PeerMessage::Forward { tx } = envelope.message {
            node.order(tx).await;
            flushed += 1;
        }
    }
    info!(node = node.local_id, flushed, "leader ordering stopped");
    inbox
}

async fn run_follower(
    node: Node,
    mut next_seq: u64,
    sync_interval: Duration,
    mut submissions: mpsc::Receiver<Transaction>,
    mut inbox: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Envelope> {
    let mut out_of_order: BTreeMap<u64, Transaction> = BTreeMap::new();
    let mut ticker = tokio::time::interval(sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(tx) = submissions.recv() => node.forward(tx).await,
            Some(envelope) = inbox.recv() => {
                if envelope.from != node.leader {
                    debug!(from = envelope.from, "follower ignoring message from non-leader");
                    continue;
                }
                if let PeerMessage::Ordered { seq, tx } = envelope.message {
                    if seq >= next_seq {
                        out_of_order.insert(seq, tx);
                    }
                    next_seq = node.persist_contiguous(next_seq, &mut out_of_order);
                    if !out_of_order.is_empty() {
                        node.request_sync(next_seq).await;
                    }
                }
            }
            _ = ticker.tick() => node.request_sync(next_seq).await,
        }
    }

    while let Ok(tx) = submissions.try_recv() {
        node.forward(tx).await;
    }
    info!(node = node.local_id, next_seq, "follower ordering stopped");
    inbox
}

impl Node {
    async fn order(&self, tx: Transaction) {
        let seq = match self.log.append(&tx) {
            Ok(Some(seq)) => seq,
            Ok(None) => {
                debug!(tx_hash = %tx.hash(), "transaction already ordered");
                return;
            }
            Err(err) => {
                error!(tx_hash = %tx.hash(), error = %err, "cannot append to ordered log");
                return;
            }
        };
        debug!(seq, tx_hash = %tx.hash(), "transaction ordered");

        for &peer in self.members.iter().filter(|&&peer| peer != self.local_id) {
            let message = PeerMessage::Ordered {
                seq,
                tx: tx.clone(),
            };
            if let Err(err) = self.transport.send(peer, message).await {
                debug!(peer, seq, error = %err, "ordered broadcast not delivered");
            }
        }
    }

    async fn on_leader_message(&self, envelope: Envelope) {
        match envelope.message {
            PeerMessage::Forward { tx } => self.order(tx).await,
            PeerMessage::SyncRequest { next_seq } => self.answer_sync(envelope.from, next_seq).await,
            other => debug!(from = envelope.from, message = ?other, "leader ignoring message"),
        }
    }

    async fn answer_sync(&self, peer: NodeId, next_seq: u64) {
        let page = match self.log.page(next_seq, SYNC_PAGE_SIZE) {
            Ok(page) => page,
            Err(err) => {
                error!(peer, next_seq, error = %err, "cannot load ordered page for sync");
                return;
            }
        };
        for entry in page {
            let message = PeerMessage::Ordered {
                seq: entry.seq,
                tx: entry.tx,
            };
            if let Err(err) = self.transport.send(peer, message).await {
                debug!(peer, error = %err, "sync reply interrupted");
                return;
            }
        }
    }

    async fn forward(&self, tx: Transaction) {
        let tx_hash = tx.hash();
        if let Err(err) = self
            .transport
            .send(self.leader, PeerMessage::Forward { tx })
            .await
        {
            warn!(leader = self.leader, %tx_hash, error = %err, "forward to leader failed");
        }
    }

    async fn request_sync(&self, next_seq: u64) {
        if let Err(err) = self
            .transport
            .send(self.leader, PeerMessage::SyncRequest { next_seq })
            .await
        {
            debug!(leader = self.leader, error = %err, "sync request failed");
        }
    }

    fn persist_contiguous(
        &self,
        mut next_seq: u64,
        out_of_order: &mut BTreeMap<u64, Transaction>,
    ) -> u64 {
        while let Some(tx) = out_of_order.remove(&next_seq) {
            if let Err(err) = self.log.insert_at(next_seq, &tx) {
                error!(seq = next_seq, error = %err, "cannot persist ordered entry");
                out_of_order.insert(next_seq, tx);
                break;
            }
            next_seq += 1;
        }
        // Anything below the head is already persisted.
        out_of_order.retain(|&seq, _| seq >= next_seq);
        next_seq
    }
}
