// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Binary Merkle tree over namespace blobs.
//!
//! Leaves and inner nodes are hashed under distinct domain prefixes so a node
//! can never be passed off as a leaf. A node without a right sibling is
//! promoted unchanged to the next level, which is why verification needs the
//! tree size.

use alloy_primitives::{B256, keccak256};

const DOMAIN_LEAF: &[u8] = b"ROLLUP_DA_LEAF_V1";
const DOMAIN_NODE: &[u8] = b"ROLLUP_DA_NODE_V1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub siblings: Vec<B256>,
}

pub fn leaf_hash(data: &[u8]) -> B256 {
    let mut preimage = Vec::with_capacity(DOMAIN_LEAF.len() + data.len());
    preimage.extend_from_slice(DOMAIN_LEAF);
    preimage.extend_from_slice(data);
    keccak256(preimage)
}

pub fn node_hash(left: &B256, right: &B256) -> B256 {
    let mut preimage = Vec::with_capacity(DOMAIN_NODE.len() + 64);
    preimage.extend_from_slice(DOMAIN_NODE);
    preimage.extend_from_slice(left.as_slice());
    preimage.extend_from_slice(right.as_slice());
    keccak256(preimage)
}

/// Root of `leaves`; the empty tree has the zero root.
pub fn root(leaves: &[B256]) -> B256 {
    if leaves.is_empty() {
        return B256::ZERO;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

pub fn prove(leaves: &[B256], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }
    let mut siblings = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = position ^ 1;
        if sibling < level.len() {
            siblings.push(level[sibling]);
        }
        level = next_level(&level);
        position /= 2;
    }
    Some(MerkleProof {
        leaf_index: index as u64,
        siblings,
    })
}

/// Checks that `leaf` sits at `proof.leaf_index` of a tree with `size` leaves
/// and the given `root`.
pub fn verify(root: &B256, leaf: &B256, proof: &MerkleProof, size: u64) -> bool {
    if proof.leaf_index >= size {
        return false;
    }
    let mut siblings = proof.siblings.iter();
    let mut hash = *leaf;
    let mut position = proof.leaf_index;
    let mut width = size;
    while width > 1 {
        if position % 2 == 1 {
            let Some(left) = siblings.next() else {
                return false;
            };
            hash = node_hash(left, &hash);
        } else if position + 1 < width {
            let Some(right) = siblings.next() else {
                return false;
            };
            hash = node_hash(&hash, right);
        }
        position /= 2;
        width = width.div_ceil(2);
    }
    siblings.next().is_none() && hash == *root
}

fn next_level(level: &[B256]) -> Vec<B256> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => node_hash(left, right),
            [single] => *single,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}
