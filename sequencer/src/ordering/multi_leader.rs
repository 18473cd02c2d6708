// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeSet;
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
    Proposal, decided_order,
};

const SUBMISSION_QUEUE_CAPACITY: usize = 1024;
// Rounds a member may run ahead of the decided watermark.
const MAX_UNDECIDED_ROUNDS: u64 = 8;
const MAX_PROPOSALS_PER_REPLY: usize = 512;

/// Every member proposes once per round; a round is decided once all members'
/// proposals are present.
pub struct MultiLeader {
    members: Vec<NodeId>,
    round_interval: Duration,
    transport: Arc<dyn PeerTransport>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    submissions: mpsc::Sender<Transaction>,
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<Envelope>>,
}

struct Rounds {
    local_id: NodeId,
    members: Vec<NodeId>,
    transport: Arc<dyn PeerTransport>,
    log: OrderedLog,
    decided_round: u64,
    next_own_round: u64,
    // Highest round any other member has proposed for.
    highest_seen_round: Option<u64>,
    pending: Vec<Transaction>,
}

impl MultiLeader {
    pub fn new(
        members: Vec<NodeId>,
        round_interval: Duration,
        transport: Arc<dyn PeerTransport>,
        inbox: mpsc::Receiver<Envelope>,
    ) -> Self {
        let members: BTreeSet<NodeId> = members.into_iter().collect();
        Self {
            members: members.into_iter().collect(),
            round_interval: round_interval.max(Duration::from_millis(1)),
            transport,
            inbox: Mutex::new(Some(inbox)),
            running: Mutex::new(None),
        }
    }

    fn load_rounds(&self, log: OrderedLog) -> Result<Rounds, OrderingError> {
        let local_id = self.transport.local_id();
        let decided_round = log.decided_round()?;
        let next_own_round = log.next_own_round(local_id)?.max(decided_round);
        let highest_seen_round = log
            .proposals_from(decided_round)?
            .iter()
            .filter(|proposal| proposal.origin != local_id)
            .map(|proposal| proposal.round)
            .max();
        Ok(Rounds {
            local_id,
            members: self.members.clone(),
            transport: self.transport.clone(),
            log,
            decided_round,
            next_own_round,
            highest_seen_round,
            pending: Vec::new(),
        })
    }
}

#[async_trait]
impl OrderingProtocol for MultiLeader {
    async fn start(&self, log: OrderedLog) -> Result<(), OrderingError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(OrderingError::AlreadyStarted);
        }
        let mut rounds = self.load_rounds(log)?;
        let Some(inbox) = self.inbox.lock().await.take() else {
            return Err(OrderingError::Stopped);
        };

        if !rounds.members.contains(&rounds.local_id) {
            warn!(node = rounds.local_id, "node is not a member; it will only observe");
        }
        info!(
            node = rounds.local_id,
            members = ?rounds.members,
            decided_round = rounds.decided_round,
            next_own_round = rounds.next_own_round,
            "multi-leader ordering started"
        );
        rounds.request_missing().await;
        rounds.try_decide();

        let (submissions, submission_rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_rounds(
            rounds,
            self.round_interval,
            submission_rx,
            inbox,
            cancel.clone(),
        ));
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

async fn run_rounds(
    mut rounds: Rounds,
    round_interval: Duration,
    mut submissions: mpsc::Receiver<Transaction>,
    mut inbox: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Envelope> {
    let mut ticker = tokio::time::interval(round_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(tx) = submissions.recv() => rounds.pending.push(tx),
            Some(envelope) = inbox.recv() => rounds.on_message(envelope).await,
            _ = ticker.tick() => rounds.on_tick().await,
        }
    }

    while let Ok(tx) = submissions.try_recv() {
        rounds.pending.push(tx);
    }
    if !rounds.pending.is_empty() {
        // Offer what we hold so the others can decide it without us.
        rounds.propose_next().await;
    }
    info!(
        node = rounds.local_id,
        decided_round = rounds.decided_round,
        unproposed = rounds.pending.len(),
        "multi-leader ordering stopped"
    );
    inbox
}

impl Rounds {
    fn is_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    async fn on_tick(&mut self) {
        if self.decided_round.saturating_add(1) < self.next_own_round {
            self.request_missing().await;
        }
        self.propose_next().await;
        self.try_decide();
    }

    /// Proposes the pending transactions for the next own round, first filling
    /// every round other members already moved past with empty proposals.
    async fn propose_next(&mut self) {
        if !self.is_member(self.local_id) {
            return;
        }
        if let Some(highest) = self.highest_seen_round {
            while self.next_own_round < highest {
                let round = self.next_own_round;
                if !self.propose(round, Vec::new()).await {
                    return;
                }
            }
        }
        if self.next_own_round >= self.decided_round.saturating_add(MAX_UNDECIDED_ROUNDS) {
            debug!(
                decided_round = self.decided_round,
                next_own_round = self.next_own_round,
                "waiting for undecided rounds"
            );
            return;
        }
        let txs = std::mem::take(&mut self.pending);
        let round = self.next_own_round;
        let _ = self.propose(round, txs).await;
    }

    async fn propose(&mut self, round: u64, txs: Vec<Transaction>) -> bool {
        let proposal = Proposal::new(round, self.local_id, &txs);
        if let Err(err) = self.log.store_proposal(&proposal) {
            error!(round, error = %err, "cannot persist own proposal");
            self.pending.extend(txs);
            return false;
        }
        self.next_own_round = round.saturating_add(1);
        if !txs.is_empty() {
            debug!(round, txs = txs.len(), "proposed");
        }
        self.broadcast(PeerMessage::Proposal(proposal)).await;
        true
    }

    async fn on_message(&mut self, envelope: Envelope) {
        match envelope.message {
            PeerMessage::Proposal(proposal) => self.on_proposal(proposal),
            PeerMessage::ProposalRequest { since_round } => {
                self.answer_request(envelope.from, since_round).await
            }
            other => debug!(from = envelope.from, message = ?other, "ignoring message"),
        }
    }

    fn on_proposal(&mut self, proposal: Proposal) {
        if !self.is_member(proposal.origin) {
            debug!(origin = proposal.origin, "ignoring proposal from non-member");
            return;
        }
        if proposal.round < self.decided_round {
            return;
        }
        match self.log.store_proposal(&proposal) {
            Ok(_) => {}
            Err(err) => {
                error!(round = proposal.round, error = %err, "cannot persist proposal");
                return;
            }
        }
        if proposal.origin == self.local_id {
            self.next_own_round = self.next_own_round.max(proposal.round.saturating_add(1));
        } else {
            self.highest_seen_round = Some(
                self.highest_seen_round
                    .map_or(proposal.round, |seen| seen.max(proposal.round)),
            );
        }
        self.try_decide();
    }

    async fn answer_request(&self, peer: NodeId, since_round: u64) {
        let proposals = match self.log.proposals_from(since_round) {
            Ok(proposals) => proposals,
            Err(err) => {
                error!(peer, since_round, error = %err, "cannot load proposals");
                return;
            }
        };
        for proposal in proposals.into_iter().take(MAX_PROPOSALS_PER_REPLY) {
            if let Err(err) = self
                .transport
                .send(peer, PeerMessage::Proposal(proposal))
                .await
            {
                debug!(peer, error = %err, "proposal reply interrupted");
                return;
            }
        }
    }

    async fn request_missing(&self) {
        self.broadcast(PeerMessage::ProposalRequest {
            since_round: self.decided_round,
        })
        .await;
    }

    async fn broadcast(&self, message: PeerMessage) {
        for &peer in self.members.iter().filter(|&&peer| peer != self.local_id) {
            if let Err(err) = self.transport.send(peer, message.clone()).await {
                debug!(peer, error = %err, "broadcast not delivered");
            }
        }
    }

    /// Folds every complete round at the watermark into the ordered log.
    fn try_decide(&mut self) {
        loop {
            let proposals = match self.log.proposals_from(self.decided_round) {
                Ok(proposals) => proposals,
                Err(err) => {
                    error!(round = self.decided_round, error = %err, "cannot load proposals");
                    return;
                }
            };
            let round = self.decided_round;
            let current: Vec<Proposal> = proposals
                .into_iter()
                .filter(|proposal| proposal.round == round && self.is_member(proposal.origin))
                .collect();
            if current.len() < self.members.len() {
                return;
            }

            let txs = decided_order(current);
            match self.log.commit_round(round, &txs) {
                Ok(assigned) => {
                    if !assigned.is_empty() {
                        debug!(round, ordered = assigned.len(), "round decided");
                    }
                    self.decided_round = round.saturating_add(1);
                    self.next_own_round = self.next_own_round.max(self.decided_round);
                }
                Err(err) => {
                    error!(round, error = %err, "cannot commit decided round");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MultiLeader;
    use crate::ordering::{Mesh, OrderedLog, OrderingProtocol};
    use crate::storage::Storage;
    use app_core::Transaction;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const ROUND_INTERVAL: Duration = Duration::from_millis(10);

    fn open_log(dir: &TempDir, name: &str) -> OrderedLog {
        let path = dir.path().join(format!("{name}.sqlite"));
        let storage =
            Storage::open(path.to_string_lossy().as_ref(), "NORMAL").expect("open storage");
        OrderedLog::new(Arc::new(Mutex::new(storage)))
    }

    fn member(mesh: &Mesh, id: u64) -> MultiLeader {
        let (transport, inbox) = mesh.join(id);
        MultiLeader::new(vec![1, 2, 3], ROUND_INTERVAL, Arc::new(transport), inbox)
    }

    async fn wait_for_len(log: &OrderedLog, len: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while log.next_seq().expect("next seq") < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ordered log did not reach expected length");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_members_converge_on_the_same_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mesh = Mesh::new();
        let nodes: Vec<MultiLeader> = (1..=3).map(|id| member(&mesh, id)).collect();
        let logs: Vec<OrderedLog> = (1..=3)
            .map(|id| open_log(&dir, &format!("node-{id}")))
            .collect();

        for (node, log) in nodes.iter().zip(logs.iter()) {
            node.start(log.clone()).await.expect("start member");
        }

        let shared = Transaction::new(vec![0xee]);
        for (index, node) in nodes.iter().enumerate() {
            node.submit(Transaction::new(vec![index as u8]))
                .await
                .expect("submit own tx");
            node.submit(shared.clone()).await.expect("submit shared tx");
        }

        for log in &logs {
            wait_for_len(log, 4).await;
        }
        let reference = logs[0].page(0, 16).expect("page");
        assert_eq!(reference.len(), 4);
        for log in &logs[1..] {
            assert_eq!(log.page(0, 16).expect("page"), reference);
        }

        for node in &nodes {
            node.stop().await.expect("stop member");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restarted_member_catches_up_and_rounds_resume() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mesh = Mesh::new();
        let nodes: Vec<MultiLeader> = (1..=3).map(|id| member(&mesh, id)).collect();
        let logs: Vec<OrderedLog> = (1..=3)
            .map(|id| open_log(&dir, &format!("node-{id}")))
            .collect();
        for (node, log) in nodes.iter().zip(logs.iter()) {
            node.start(log.clone()).await.expect("start member");
        }

        nodes[0]
            .submit(Transaction::new(vec![0x01]))
            .await
            .expect("submit");
        for log in &logs {
            wait_for_len(log, 1).await;
        }

        nodes[2].stop().await.expect("stop third member");
        nodes[1]
            .submit(Transaction::new(vec![0x02]))
            .await
            .expect("submit while member is down");
        tokio::time::sleep(ROUND_INTERVAL * 5).await;
        // No round can be decided without the third member.
        assert_eq!(logs[1].next_seq().expect("next seq"), 1);

        nodes[2]
            .start(logs[2].clone())
            .await
            .expect("restart third member");
        for log in &logs {
            wait_for_len(log, 2).await;
        }
        let reference = logs[0].page(0, 16).expect("page");
        assert_eq!(logs[2].page(0, 16).expect("page"), reference);

        for node in &nodes {
            node.stop().await.expect("stop member");
        }
    }
}
