// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Verifiable publication of ordered data to a data-availability layer.

mod backend;
mod client;
mod memory;
pub mod merkle;
mod retry;

use std::fmt;

use alloy_primitives::Address;
use app_core::Cursor;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use backend::{BackendError, DaBackend, FetchedPage, Located, NamespaceHeader, ProvenBlob};
pub use client::{DaClient, DaClientConfig};
pub use memory::MemoryDa;
pub use merkle::MerkleProof;
pub use retry::{Retry, RetryConfig, RetryOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finalized blob and its 1-based position in the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub cursor: Cursor,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("namespace header signature is malformed")]
    BadSignature,
    #[error("namespace header attested by {actual}, expected {expected}")]
    UnknownAttester { expected: Address, actual: Address },
    #[error("header is for namespace {actual}, requested {expected}")]
    NamespaceMismatch { expected: Namespace, actual: Namespace },
    #[error("inclusion proof for cursor {cursor} does not match the header root")]
    InvalidProof { cursor: u64 },
    #[error("cursor {cursor} outside attested range 1..={size}")]
    OutOfRange { cursor: u64, size: u64 },
    #[error("expected cursor {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },
    #[error("located blob does not match the requested content")]
    ContentMismatch,
    #[error("no blobs served from cursor {cursor} although namespace size is {size}")]
    Withheld { cursor: u64, size: u64 },
    #[error("latest page ends at {last}, namespace size is {size}")]
    StaleLatest { last: u64, size: u64 },
}

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("blob not found")]
    NotFound,
    #[error("DA response failed verification")]
    Verification(#[source] VerificationError),
    #[error("DA transport failure")]
    Transport {
        #[source]
        source: BackendError,
    },
    #[error("DA layer rejected the blob: {reason}")]
    Rejected { reason: String },
    #[error("invalid blob: {reason}")]
    InvalidBlob { reason: String },
}

impl PublisherError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<BackendError> for PublisherError {
    fn from(source: BackendError) -> Self {
        match source {
            BackendError::Rejected { reason } => Self::Rejected { reason },
            source @ BackendError::Unavailable { .. } => Self::Transport { source },
        }
    }
}

impl From<VerificationError> for PublisherError {
    fn from(value: VerificationError) -> Self {
        Self::Verification(value)
    }
}

/// Read side of a namespace. Every returned blob has been verified.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Up to `limit` blobs starting at `cursor`, ascending. Cursor 0 asks for
    /// the latest page; limit 0 lets the server choose the page size. Callers
    /// continue from `last.cursor + 1`.
    async fn get(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        cursor: Cursor,
        limit: u64,
    ) -> Result<Vec<Blob>, PublisherError>;

    /// Cursor at which `data` was finalized.
    async fn has(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        data: &[u8],
    ) -> Result<Cursor, PublisherError>;
}

#[async_trait]
pub trait Writer: Send + Sync {
    /// Returns once the DA layer accepted `data`; it becomes readable after
    /// finalization.
    async fn set(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        data: &[u8],
    ) -> Result<(), PublisherError>;
}

pub trait Publisher: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> Publisher for T {}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, PublisherError>
where
    F: std::future::Future<Output = Result<T, PublisherError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PublisherError::Cancelled),
        result = fut => result,
    }
}
