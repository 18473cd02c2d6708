// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use ssz::{Decode as _, Encode as _};
use ssz_derive::{Decode, Encode};
use thiserror::Error;

use crate::tx::{OrderedTx, Transaction};

/// Unit of publication: a contiguous slice `[first_seq, end_seq())` of the
/// ordered log.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Batch {
    pub first_seq: u64,
    pub txs: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
#[error("cannot decode batch: {reason}")]
pub struct BatchDecodeError {
    reason: String,
}

impl Batch {
    pub fn from_ordered(txs: &[OrderedTx]) -> Option<Self> {
        let first_seq = txs.first()?.seq;
        for (offset, item) in txs.iter().enumerate() {
            assert_eq!(
                item.seq,
                first_seq + offset as u64,
                "batch must be built from a contiguous slice of the ordered log"
            );
        }
        Some(Self {
            first_seq,
            txs: txs.iter().map(|item| item.tx.as_bytes().to_vec()).collect(),
        })
    }

    pub fn end_seq(&self) -> u64 {
        self.first_seq.saturating_add(self.txs.len() as u64)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BatchDecodeError> {
        Self::from_ssz_bytes(bytes).map_err(|err| BatchDecodeError {
            reason: format!("{err:?}"),
        })
    }

    pub fn into_ordered(self) -> Vec<OrderedTx> {
        let first_seq = self.first_seq;
        self.txs
            .into_iter()
            .enumerate()
            .map(|(offset, bytes)| OrderedTx {
                seq: first_seq + offset as u64,
                tx: Transaction::new(bytes),
            })
            .collect()
    }
}
