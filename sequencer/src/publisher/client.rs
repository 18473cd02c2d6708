// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, B256, keccak256};
use app_core::Cursor;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{DaBackend, NamespaceHeader, ProvenBlob};
use super::retry::{Retry, RetryConfig};
use super::{Blob, Namespace, PublisherError, Reader, VerificationError, Writer, cancellable, merkle};

pub const DEFAULT_MAX_BLOB_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DaClientConfig {
    /// Only headers signed by this address are trusted.
    pub attester: Address,
    pub max_blob_bytes: usize,
    pub retry: RetryConfig,
}

impl DaClientConfig {
    pub fn new(attester: Address) -> Self {
        Self {
            attester,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            retry: RetryConfig::default(),
        }
    }
}

/// Verifying [`Reader`]/[`Writer`] over an untrusted [`DaBackend`].
pub struct DaClient<B> {
    backend: B,
    config: DaClientConfig,
}

impl<B: DaBackend> DaClient<B> {
    pub fn new(backend: B, config: DaClientConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn verify_header(
        &self,
        namespace: &Namespace,
        header: &NamespaceHeader,
    ) -> Result<(), VerificationError> {
        let actual = header
            .recover_attester()
            .map_err(|_| VerificationError::BadSignature)?;
        if actual != self.config.attester {
            return Err(VerificationError::UnknownAttester {
                expected: self.config.attester,
                actual,
            });
        }
        if header.namespace != *namespace {
            return Err(VerificationError::NamespaceMismatch {
                expected: namespace.clone(),
                actual: header.namespace.clone(),
            });
        }
        Ok(())
    }

    async fn locate_verified(
        &self,
        namespace: &Namespace,
        content_hash: B256,
        data: &[u8],
    ) -> Result<Option<Cursor>, PublisherError> {
        let Some(located) = self.backend.locate(namespace, content_hash).await? else {
            return Ok(None);
        };
        self.verify_header(namespace, &located.header)?;
        if located.blob.data != data {
            return Err(VerificationError::ContentMismatch.into());
        }
        verify_blob(&located.header, &located.blob)?;
        Ok(Some(located.blob.cursor))
    }
}

fn verify_blob(header: &NamespaceHeader, blob: &ProvenBlob) -> Result<(), VerificationError> {
    let cursor = blob.cursor.get();
    if cursor == 0 || cursor > header.size {
        return Err(VerificationError::OutOfRange {
            cursor,
            size: header.size,
        });
    }
    let leaf = merkle::leaf_hash(&blob.data);
    if blob.proof.leaf_index != cursor - 1
        || !merkle::verify(&header.root, &leaf, &blob.proof, header.size)
    {
        return Err(VerificationError::InvalidProof { cursor });
    }
    Ok(())
}

#[async_trait]
impl<B: DaBackend> Reader for DaClient<B> {
    async fn get(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        cursor: Cursor,
        limit: u64,
    ) -> Result<Vec<Blob>, PublisherError> {
        cancellable(cancel, async {
            let page = self.backend.fetch(namespace, cursor, limit).await?;
            self.verify_header(namespace, &page.header)?;
            let size = page.header.size;

            let mut expected = if cursor.is_latest() {
                page.blobs.first().map(|blob| blob.cursor.get())
            } else {
                Some(cursor.get())
            };
            let mut blobs = Vec::with_capacity(page.blobs.len());
            for blob in page.blobs {
                let actual = blob.cursor.get();
                match expected {
                    Some(expected) if actual != expected => {
                        return Err(VerificationError::NonContiguous { expected, actual }.into());
                    }
                    _ => {}
                }
                verify_blob(&page.header, &blob)?;
                expected = Some(actual + 1);
                blobs.push(Blob {
                    cursor: blob.cursor,
                    data: blob.data,
                });
            }

            if cursor.is_latest() {
                let last = blobs.last().map_or(0, |blob| blob.cursor.get());
                if last != size {
                    return Err(VerificationError::StaleLatest { last, size }.into());
                }
                if limit > 0 && blobs.len() as u64 > limit {
                    let excess = blobs.len() - limit as usize;
                    blobs.drain(..excess);
                }
            } else {
                if blobs.is_empty() && cursor.get() <= size {
                    return Err(VerificationError::Withheld {
                        cursor: cursor.get(),
                        size,
                    }
                    .into());
                }
                if limit > 0 {
                    blobs.truncate(limit as usize);
                }
            }
            Ok(blobs)
        })
        .await
    }

    async fn has(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        data: &[u8],
    ) -> Result<Cursor, PublisherError> {
        cancellable(cancel, async {
            self.locate_verified(namespace, keccak256(data), data)
                .await?
                .ok_or(PublisherError::NotFound)
        })
        .await
    }
}

#[async_trait]
impl<B: DaBackend> Writer for DaClient<B> {
    async fn set(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        data: &[u8],
    ) -> Result<(), PublisherError> {
        if data.is_empty() {
            return Err(PublisherError::InvalidBlob {
                reason: "empty blob".to_string(),
            });
        }
        if data.len() > self.config.max_blob_bytes {
            return Err(PublisherError::InvalidBlob {
                reason: format!(
                    "blob too large: max {} bytes, got {} bytes",
                    self.config.max_blob_bytes,
                    data.len()
                ),
            });
        }
        let content_hash = keccak256(data);

        cancellable(cancel, async {
            let outcome = Retry::new(self.config.retry.clone())
                .run_with_predicate(
                    |attempt| async move {
                        if attempt > 0 {
                            let landed = self.locate_verified(namespace, content_hash, data).await?;
                            if let Some(cursor) = landed {
                                debug!(
                                    namespace = %namespace,
                                    cursor = cursor.get(),
                                    "earlier submission already finalized"
                                );
                                return Ok(());
                            }
                        }
                        self.backend
                            .submit(namespace, data.to_vec())
                            .await
                            .map_err(PublisherError::from)
                    },
                    PublisherError::is_retryable,
                )
                .await;
            if let Err(err) = &outcome.result {
                warn!(
                    namespace = %namespace,
                    attempts = outcome.attempts,
                    error = %err,
                    "DA submission failed"
                );
            }
            outcome.result
        })
        .await
    }
}
