// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex, MutexGuard};

use app_core::{OrderedTx, Transaction};

use super::proposal::Proposal;
use crate::storage::Storage;

/// Handle on the persisted total order shared by the node's components.
///
/// Every append goes through SQLite before anything else observes it, so a
/// decision that was broadcast is always a decision that survives a crash.
#[derive(Clone)]
pub struct OrderedLog {
    storage: Arc<Mutex<Storage>>,
}

impl OrderedLog {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        Self { storage }
    }

    pub fn lock(&self) -> MutexGuard<'_, Storage> {
        lock_storage(&self.storage)
    }

    pub fn next_seq(&self) -> rusqlite::Result<u64> {
        self.lock().next_ordered_seq()
    }

    pub fn append(&self, tx: &Transaction) -> rusqlite::Result<Option<u64>> {
        self.lock().append_ordered(tx)
    }

    pub fn insert_at(&self, seq: u64, tx: &Transaction) -> rusqlite::Result<()> {
        self.lock().insert_ordered_at(seq, tx)
    }

    pub fn page(&self, from_inclusive: u64, limit: usize) -> rusqlite::Result<Vec<OrderedTx>> {
        let mut out = Vec::new();
        self.lock().fill_ordered_txs(from_inclusive, limit, &mut out)?;
        Ok(out)
    }

    pub fn decided_round(&self) -> rusqlite::Result<u64> {
        self.lock().decided_round()
    }

    /// Stores a proposal; `false` if that (round, origin) was already known.
    pub fn store_proposal(&self, proposal: &Proposal) -> rusqlite::Result<bool> {
        self.lock()
            .store_proposal(proposal.round, proposal.origin, proposal.encode().as_slice())
    }

    pub fn next_own_round(&self, origin: u64) -> rusqlite::Result<u64> {
        Ok(self
            .lock()
            .max_proposal_round(origin)?
            .map_or(0, |round| round.saturating_add(1)))
    }

    /// Stored proposals from `round` on; rows that fail to decode are skipped.
    pub fn proposals_from(&self, round: u64) -> rusqlite::Result<Vec<Proposal>> {
        let rows = self.lock().load_proposals_from(round)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| Proposal::decode(row.txs.as_slice()))
            .collect())
    }

    pub fn commit_round(&self, round: u64, txs: &[Transaction]) -> rusqlite::Result<Vec<u64>> {
        self.lock().commit_decided_round(round, txs)
    }
}

pub(crate) fn lock_storage(storage: &Mutex<Storage>) -> MutexGuard<'_, Storage> {
    // SQLite transactions are atomic, so a poisoned guard still wraps a consistent database.
    storage
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
