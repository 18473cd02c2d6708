// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Rebuilds execution state from published batches alone.

use std::sync::Arc;
use std::time::Duration;

use app_core::application::Application;
use app_core::{Batch, BatchDecodeError, Cursor, OrderedTx};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::{Executor, ExecutorError};
use crate::publisher::{Namespace, PublisherError, Reader};

#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Blobs per `get`; 0 lets the DA layer decide.
    pub page_size: u64,
    pub poll_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            page_size: 0,
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot read namespace")]
    Publisher {
        #[source]
        source: PublisherError,
    },
    #[error("blob at cursor {cursor} is not a batch")]
    Decode {
        cursor: u64,
        #[source]
        source: BatchDecodeError,
    },
    #[error("blob at cursor {cursor} starts at seq {first_seq}, expected at most {expected_seq}")]
    Gap {
        cursor: u64,
        expected_seq: u64,
        first_seq: u64,
    },
    #[error("replay of seq {seq} failed")]
    Execute {
        seq: u64,
        #[source]
        source: ExecutorError,
    },
    #[error("replay worker panicked")]
    Worker,
}

impl From<PublisherError> for ReplayError {
    fn from(source: PublisherError) -> Self {
        Self::Publisher { source }
    }
}

/// Follows a namespace from cursor 1 and feeds every batch into its own
/// executor. Batches already covered by the executor (a re-published batch,
/// or a restart) are skipped; a batch that starts past the executor's next
/// input is a gap.
pub struct Replayer<A: Application + 'static> {
    reader: Arc<dyn Reader>,
    namespace: Namespace,
    executor: Arc<Executor<A>>,
    next_cursor: Cursor,
    config: ReplayConfig,
}

impl<A: Application + 'static> Replayer<A> {
    pub fn new(
        reader: Arc<dyn Reader>,
        namespace: Namespace,
        executor: Arc<Executor<A>>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            reader,
            namespace,
            executor,
            next_cursor: Cursor(1),
            config,
        }
    }

    pub fn executor(&self) -> &Arc<Executor<A>> {
        &self.executor
    }

    pub fn next_cursor(&self) -> Cursor {
        self.next_cursor
    }

    /// Reads until the namespace has nothing new; returns how many inputs
    /// were executed.
    pub async fn sync(&mut self, cancel: &CancellationToken) -> Result<u64, ReplayError> {
        let mut executed = 0_u64;
        loop {
            let page = self
                .reader
                .get(cancel, &self.namespace, self.next_cursor, self.config.page_size)
                .await?;
            let Some(last) = page.last() else {
                return Ok(executed);
            };
            let next_cursor = last.cursor.next();

            for blob in page {
                let batch = Batch::decode(&blob.data).map_err(|source| ReplayError::Decode {
                    cursor: blob.cursor.get(),
                    source,
                })?;
                executed += self.apply_batch(blob.cursor, batch).await?;
            }
            self.next_cursor = next_cursor;
        }
    }

    /// Syncs every `poll_interval` until cancelled.
    pub async fn follow(mut self, cancel: CancellationToken) -> Result<(), ReplayError> {
        info!(namespace = %self.namespace, "replayer following namespace");
        loop {
            match self.sync(&cancel).await {
                Ok(executed) if executed > 0 => {
                    info!(
                        executed,
                        cursor = self.executor.cursor().get(),
                        next_da_cursor = self.next_cursor.get(),
                        "replayed batches"
                    );
                }
                Ok(_) => {}
                Err(ReplayError::Publisher {
                    source: PublisherError::Cancelled,
                }) => return Ok(()),
                Err(err) => return Err(err),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn apply_batch(&self, cursor: Cursor, batch: Batch) -> Result<u64, ReplayError> {
        let expected_seq = self.executor.processed_inputs();
        if batch.end_seq() <= expected_seq {
            debug!(cursor = cursor.get(), first_seq = batch.first_seq, "batch already replayed");
            return Ok(0);
        }
        if batch.first_seq > expected_seq {
            return Err(ReplayError::Gap {
                cursor: cursor.get(),
                expected_seq,
                first_seq: batch.first_seq,
            });
        }

        let skip = (expected_seq - batch.first_seq) as usize;
        let pending: Vec<OrderedTx> = batch.into_ordered().into_iter().skip(skip).collect();
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || {
            let count = pending.len() as u64;
            for entry in pending {
                executor
                    .execute(entry.seq, &entry.tx)
                    .map_err(|source| ReplayError::Execute {
                        seq: entry.seq,
                        source,
                    })?;
            }
            Ok(count)
        })
        .await
        .map_err(|_| ReplayError::Worker)?
    }
}
