// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! In-process DA layer.
//!
//! Submissions wait in a pending queue until `seal` finalizes them, which
//! assigns cursors and re-attests the namespace header. Faults can be injected
//! for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_primitives::{Address, B256, Signature, keccak256};
use app_core::Cursor;
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Namespace;
use super::backend::{BackendError, DaBackend, FetchedPage, Located, NamespaceHeader, ProvenBlob};
use super::merkle;

pub const DEFAULT_PAGE_SIZE: u64 = 64;
pub const MAX_PAGE_SIZE: u64 = 1024;

#[derive(Default)]
struct NamespaceLog {
    blobs: Vec<Vec<u8>>,
    leaves: Vec<B256>,
    index_by_hash: HashMap<B256, usize>,
    pending: Vec<Vec<u8>>,
    pending_hashes: HashSet<B256>,
}

impl NamespaceLog {
    fn size(&self) -> u64 {
        self.blobs.len() as u64
    }

    fn proven(&self, index: usize) -> Option<ProvenBlob> {
        let proof = merkle::prove(&self.leaves, index)?;
        Some(ProvenBlob {
            cursor: Cursor(index as u64 + 1),
            data: self.blobs[index].clone(),
            proof,
        })
    }
}

#[derive(Default)]
struct Faults {
    failing_submits: AtomicU32,
    failing_fetches: AtomicU32,
    latency_ms: AtomicU64,
    corrupt_blobs: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MemoryDa {
    signing_key: SigningKey,
    attester: Address,
    namespaces: Mutex<HashMap<Namespace, NamespaceLog>>,
    faults: Faults,
}

impl MemoryDa {
    pub fn new(secret: [u8; 32]) -> Result<Self, k256::ecdsa::Error> {
        let signing_key = SigningKey::from_bytes((&secret).into())?;
        let verifying = signing_key.verifying_key().to_encoded_point(false);
        let attester = Address::from_raw_public_key(&verifying.as_bytes()[1..]);
        Ok(Self {
            signing_key,
            attester,
            namespaces: Mutex::new(HashMap::new()),
            faults: Faults::default(),
        })
    }

    /// Address that signs every namespace header.
    pub fn attester(&self) -> Address {
        self.attester
    }

    /// Finalizes every pending submission; returns how many blobs were added.
    pub fn seal(&self) -> usize {
        let mut namespaces = self.lock();
        let mut sealed = 0;
        for (namespace, log) in namespaces.iter_mut() {
            if log.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut log.pending);
            log.pending_hashes.clear();
            for data in pending {
                let hash = keccak256(&data);
                log.index_by_hash.insert(hash, log.blobs.len());
                log.leaves.push(merkle::leaf_hash(&data));
                log.blobs.push(data);
                sealed += 1;
            }
            debug!(namespace = %namespace, size = log.size(), "namespace sealed");
        }
        sealed
    }

    pub fn spawn_sealer(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sealed = self.seal();
                        if sealed > 0 {
                            info!(sealed, "memory DA sealed pending blobs");
                        }
                    }
                }
            }
        })
    }

    pub fn pending_len(&self, namespace: &Namespace) -> usize {
        self.lock().get(namespace).map_or(0, |log| log.pending.len())
    }

    pub fn size(&self, namespace: &Namespace) -> u64 {
        self.lock().get(namespace).map_or(0, NamespaceLog::size)
    }

    /// The next `count` submits fail with a transient error.
    pub fn fail_next_submits(&self, count: u32) {
        self.faults.failing_submits.store(count, Ordering::SeqCst);
    }

    /// The next `count` fetches and locates fail with a transient error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.faults.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Served blob bytes are flipped so inclusion proofs no longer match.
    pub fn set_corrupt_blobs(&self, enabled: bool) {
        self.faults.corrupt_blobs.store(enabled, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Namespace, NamespaceLog>> {
        self.namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn check_fetch_fault(&self) -> Result<(), BackendError> {
        if Faults::take(&self.faults.failing_fetches) {
            return Err(BackendError::Unavailable {
                reason: "injected fetch failure".to_string(),
            });
        }
        Ok(())
    }

    fn attest(&self, namespace: &Namespace, size: u64, root: B256) -> Result<NamespaceHeader, BackendError> {
        let digest = NamespaceHeader::digest(namespace, size, &root);
        let k256_sig: k256::ecdsa::Signature = self
            .signing_key
            .sign_prehash(digest.as_slice())
            .map_err(|err| BackendError::Unavailable {
                reason: format!("cannot sign namespace header: {err}"),
            })?;
        let signature = [false, true]
            .into_iter()
            .map(|parity| Signature::from_signature_and_parity(k256_sig, parity))
            .find(|candidate| {
                candidate
                    .recover_address_from_prehash(&digest)
                    .is_ok_and(|value| value == self.attester)
            })
            .ok_or_else(|| BackendError::Unavailable {
                reason: "no recoverable parity for header signature".to_string(),
            })?;
        Ok(NamespaceHeader {
            namespace: namespace.clone(),
            size,
            root,
            signature,
        })
    }

    fn corrupt(&self, mut blob: ProvenBlob) -> ProvenBlob {
        if self.faults.corrupt_blobs.load(Ordering::SeqCst) {
            match blob.data.first_mut() {
                Some(byte) => *byte ^= 0xff,
                None => blob.data.push(0),
            }
        }
        blob
    }
}

#[async_trait]
impl DaBackend for MemoryDa {
    async fn submit(&self, namespace: &Namespace, data: Vec<u8>) -> Result<(), BackendError> {
        // Nothing is recorded before the latency elapses.
        self.simulate_latency().await;
        if Faults::take(&self.faults.failing_submits) {
            return Err(BackendError::Unavailable {
                reason: "injected submit failure".to_string(),
            });
        }
        if data.is_empty() {
            return Err(BackendError::Rejected {
                reason: "empty blob".to_string(),
            });
        }

        let hash = keccak256(&data);
        let mut namespaces = self.lock();
        let log = namespaces.entry(namespace.clone()).or_default();
        if log.index_by_hash.contains_key(&hash) || !log.pending_hashes.insert(hash) {
            debug!(namespace = %namespace, content_hash = %hash, "duplicate submission ignored");
            return Ok(());
        }
        log.pending.push(data);
        Ok(())
    }

    async fn fetch(
        &self,
        namespace: &Namespace,
        cursor: Cursor,
        limit: u64,
    ) -> Result<FetchedPage, BackendError> {
        self.simulate_latency().await;
        self.check_fetch_fault()?;

        let page = if limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            limit.min(MAX_PAGE_SIZE)
        };
        let (size, root, blobs) = {
            let namespaces = self.lock();
            match namespaces.get(namespace) {
                None => (0, B256::ZERO, Vec::new()),
                Some(log) => {
                    let size = log.size();
                    let first = if cursor.is_latest() {
                        size.saturating_sub(page) + 1
                    } else {
                        cursor.get()
                    };
                    let last = first.saturating_add(page - 1).min(size);
                    let blobs = (first..=last)
                        .filter_map(|position| log.proven((position - 1) as usize))
                        .map(|blob| self.corrupt(blob))
                        .collect();
                    (size, merkle::root(&log.leaves), blobs)
                }
            }
        };

        Ok(FetchedPage {
            header: self.attest(namespace, size, root)?,
            blobs,
        })
    }

    async fn locate(
        &self,
        namespace: &Namespace,
        content_hash: B256,
    ) -> Result<Option<Located>, BackendError> {
        self.simulate_latency().await;
        self.check_fetch_fault()?;

        let found = {
            let namespaces = self.lock();
            namespaces.get(namespace).and_then(|log| {
                let index = *log.index_by_hash.get(&content_hash)?;
                let blob = log.proven(index)?;
                Some((log.size(), merkle::root(&log.leaves), self.corrupt(blob)))
            })
        };
        let Some((size, root, blob)) = found else {
            return Ok(None);
        };
        Ok(Some(Located {
            header: self.attest(namespace, size, root)?,
            blob,
        }))
    }
}
