// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use app_core::Transaction;
use ssz::{Decode as _, Encode as _};
use ssz_derive::{Decode, Encode};

use super::NodeId;

/// One member's contribution to a multi-leader round.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Proposal {
    pub round: u64,
    pub origin: NodeId,
    pub txs: Vec<Vec<u8>>,
}

impl Proposal {
    pub fn new(round: u64, origin: NodeId, txs: &[Transaction]) -> Self {
        Self {
            round,
            origin,
            txs: txs.iter().map(|tx| tx.as_bytes().to_vec()).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Self::from_ssz_bytes(bytes).ok()
    }

    pub fn transactions(&self) -> impl Iterator<Item = Transaction> + '_ {
        self.txs.iter().cloned().map(Transaction::new)
    }
}

/// Deterministic order of a decided round: proposals by origin, transactions
/// in proposal order.
pub fn decided_order(mut proposals: Vec<Proposal>) -> Vec<Transaction> {
    proposals.sort_by_key(|proposal| proposal.origin);
    proposals
        .iter()
        .flat_map(|proposal| proposal.transactions())
        .collect()
}
