// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use alloy_primitives::{Address, B256, Signature, SignatureError, keccak256};
use app_core::Cursor;
use async_trait::async_trait;
use thiserror::Error;

use super::Namespace;
use super::merkle::MerkleProof;

const HEADER_DOMAIN: &[u8] = b"ROLLUP_DA_HEADER_V1";

/// Attested view of a namespace: `size` finalized blobs committed to by `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHeader {
    pub namespace: Namespace,
    pub size: u64,
    pub root: B256,
    pub signature: Signature,
}

impl NamespaceHeader {
    pub fn digest(namespace: &Namespace, size: u64, root: &B256) -> B256 {
        let name = namespace.as_bytes();
        let mut preimage = Vec::with_capacity(HEADER_DOMAIN.len() + 8 + name.len() + 8 + 32);
        preimage.extend_from_slice(HEADER_DOMAIN);
        preimage.extend_from_slice(&(name.len() as u64).to_be_bytes());
        preimage.extend_from_slice(name);
        preimage.extend_from_slice(&size.to_be_bytes());
        preimage.extend_from_slice(root.as_slice());
        keccak256(preimage)
    }

    pub fn recover_attester(&self) -> Result<Address, SignatureError> {
        let digest = Self::digest(&self.namespace, self.size, &self.root);
        self.signature.recover_address_from_prehash(&digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenBlob {
    pub cursor: Cursor,
    pub data: Vec<u8>,
    pub proof: MerkleProof,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub header: NamespaceHeader,
    pub blobs: Vec<ProvenBlob>,
}

#[derive(Debug, Clone)]
pub struct Located {
    pub header: NamespaceHeader,
    pub blob: ProvenBlob,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("DA backend unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("DA backend rejected the request: {reason}")]
    Rejected { reason: String },
}

/// Raw DA layer access. Implementations are untrusted: everything they return
/// is verified by the client.
#[async_trait]
pub trait DaBackend: Send + Sync {
    /// Queues `data` for finalization in `namespace`. Submitting content that is
    /// already pending or finalized is a no-op.
    async fn submit(&self, namespace: &Namespace, data: Vec<u8>) -> Result<(), BackendError>;

    /// Finalized blobs from `cursor` (0 = latest page), at most `limit` when
    /// non-zero.
    async fn fetch(
        &self,
        namespace: &Namespace,
        cursor: Cursor,
        limit: u64,
    ) -> Result<FetchedPage, BackendError>;

    /// Finalized blob whose `keccak256` is `content_hash`.
    async fn locate(
        &self,
        namespace: &Namespace,
        content_hash: B256,
    ) -> Result<Option<Located>, BackendError>;
}

#[async_trait]
impl<T: DaBackend + ?Sized> DaBackend for Arc<T> {
    async fn submit(&self, namespace: &Namespace, data: Vec<u8>) -> Result<(), BackendError> {
        (**self).submit(namespace, data).await
    }

    async fn fetch(
        &self,
        namespace: &Namespace,
        cursor: Cursor,
        limit: u64,
    ) -> Result<FetchedPage, BackendError> {
        (**self).fetch(namespace, cursor, limit).await
    }

    async fn locate(
        &self,
        namespace: &Namespace,
        content_hash: B256,
    ) -> Result<Option<Located>, BackendError> {
        (**self).locate(namespace, content_hash).await
    }
}
