// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use app_core::Batch;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::TaskFailure;
use crate::ordering::lock_storage;
use crate::publisher::{Namespace, Publisher, PublisherError};
use crate::storage::{Storage, StoredBatch, StoredBatchError};

#[derive(Debug, Clone)]
pub struct PublicationConfig {
    pub namespace: Namespace,
    /// Pause between `has` polls and between idle checks for closed batches.
    pub poll_interval: Duration,
    /// A submitted batch still unconfirmed after this long is set again.
    pub resubmit_after: Duration,
}

impl PublicationConfig {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            poll_interval: Duration::from_millis(200),
            resubmit_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublicationError {
    #[error("cannot read batches")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot record DA cursor")]
    Confirm {
        #[source]
        source: StoredBatchError,
    },
    #[error("batch {batch_index} cannot be published")]
    Publish {
        batch_index: u64,
        #[source]
        source: PublisherError,
    },
}

impl From<rusqlite::Error> for PublicationError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Storage { source }
    }
}

/// Publishes closed batches in order, one in flight, and records the DA
/// cursor each one settled at.
pub struct PublicationLane {
    storage: Arc<Mutex<Storage>>,
    publisher: Arc<dyn Publisher>,
    config: PublicationConfig,
}

enum Settled {
    Confirmed,
    Stopped,
}

impl PublicationLane {
    pub fn new(
        storage: Arc<Mutex<Storage>>,
        publisher: Arc<dyn Publisher>,
        config: PublicationConfig,
    ) -> Self {
        Self {
            storage,
            publisher,
            config,
        }
    }

    /// Runs until `cancel` fires. Any other exit is recorded in `failure`.
    pub fn spawn(
        self,
        cancel: CancellationToken,
        failure: TaskFailure,
    ) -> JoinHandle<Result<(), PublicationError>> {
        tokio::spawn(async move {
            let result = self.run(&cancel).await;
            if let Err(err) = &result {
                error!(error = %err, "publication lane failed");
                failure.record("publication lane");
            }
            result
        })
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), PublicationError> {
        info!(namespace = %self.config.namespace, "publication lane started");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let next = lock_storage(&self.storage).next_unconfirmed_batch()?;
            let Some(batch) = next else {
                if !self.pause(cancel).await {
                    return Ok(());
                }
                continue;
            };

            let blob = self.encode_batch(&batch)?;
            match self.publish(cancel, &batch, &blob).await? {
                Settled::Confirmed => {}
                Settled::Stopped => return Ok(()),
            }
        }
    }

    fn encode_batch(&self, batch: &StoredBatch) -> Result<Vec<u8>, PublicationError> {
        let ordered = lock_storage(&self.storage).load_ordered_range(batch.first_seq, batch.end_seq)?;
        let Some(batch) = Batch::from_ordered(&ordered) else {
            unreachable!("closed batches are never empty");
        };
        Ok(batch.encode())
    }

    async fn publish(
        &self,
        cancel: &CancellationToken,
        batch: &StoredBatch,
        blob: &[u8],
    ) -> Result<Settled, PublicationError> {
        let namespace = &self.config.namespace;
        // Batches submitted before a restart go straight to confirmation.
        let mut needs_set = batch.submitted_at.is_none();
        loop {
            if needs_set {
                match self.publisher.set(cancel, namespace, blob).await {
                    Ok(()) => {}
                    Err(PublisherError::Cancelled) => return Ok(Settled::Stopped),
                    Err(err) if err.is_retryable() => {
                        warn!(batch_index = batch.batch_index, error = %err, "batch submission failed, will retry");
                        if !self.pause(cancel).await {
                            return Ok(Settled::Stopped);
                        }
                        continue;
                    }
                    Err(source) => {
                        return Err(PublicationError::Publish {
                            batch_index: batch.batch_index,
                            source,
                        });
                    }
                }
                lock_storage(&self.storage).mark_batch_submitted(batch.batch_index, SystemTime::now())?;
                debug!(
                    batch_index = batch.batch_index,
                    first_seq = batch.first_seq,
                    end_seq = batch.end_seq,
                    bytes = blob.len(),
                    "batch submitted"
                );
            }

            let submitted = Instant::now();
            loop {
                match self.publisher.has(cancel, namespace, blob).await {
                    Ok(cursor) => {
                        lock_storage(&self.storage)
                            .mark_batch_confirmed(batch.batch_index, cursor.get())
                            .map_err(|source| PublicationError::Confirm { source })?;
                        info!(
                            batch_index = batch.batch_index,
                            da_cursor = cursor.get(),
                            first_seq = batch.first_seq,
                            end_seq = batch.end_seq,
                            "batch published"
                        );
                        return Ok(Settled::Confirmed);
                    }
                    Err(PublisherError::NotFound) => {}
                    Err(PublisherError::Cancelled) => return Ok(Settled::Stopped),
                    Err(err) => {
                        warn!(batch_index = batch.batch_index, error = %err, "cannot confirm batch");
                    }
                }
                if submitted.elapsed() >= self.config.resubmit_after {
                    info!(batch_index = batch.batch_index, "batch not finalized in time, submitting again");
                    needs_set = true;
                    break;
                }
                if !self.pause(cancel).await {
                    return Ok(Settled::Stopped);
                }
            }
        }
    }

    /// Sleeps one poll interval; `false` when cancelled.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }
}
