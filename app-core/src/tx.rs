// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{B256, keccak256};

/// Opaque transaction bytes. Identity is the content; the hash is only a
/// shorthand used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    bytes: Vec<u8>,
    hash: B256,
}

impl Transaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = keccak256(bytes.as_slice());
        Self { bytes, hash }
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A transaction at its agreed position in the total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedTx {
    // Zero-based, contiguous across the whole ordered log.
    pub seq: u64,
    pub tx: Transaction,
}

#[cfg(test)]
mod tests {
    use super::Transaction;

    #[test]
    fn identity_is_content() {
        let a = Transaction::new(vec![1, 2, 3]);
        let b = Transaction::new(vec![1, 2, 3]);
        let c = Transaction::new(vec![1, 2, 4]);

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.len(), 3);
    }
}
