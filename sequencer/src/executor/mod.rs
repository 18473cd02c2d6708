// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Crash-safe executor.
//!
//! Every accepted transaction is committed to SQLite (log row + head update in
//! one transaction) before it is applied in memory. On open the in-memory
//! state is rebuilt from the newest snapshot plus the committed log after it,
//! verifying the `log_hash` chain on the way.

mod error;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use alloy_primitives::{B256, keccak256};
use app_core::application::Application;
use app_core::{Cursor, Transaction};
use tracing::{debug, info, warn};

pub use error::ExecutorError;

use crate::storage::{ExecutorMeta, ExecutorStorage};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Accepted transactions between snapshots; 0 disables snapshots.
    pub snapshot_interval: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 1_000,
        }
    }
}

struct Committed<A> {
    app: A,
    cursor: u64,
}

struct Writer {
    storage: ExecutorStorage,
    meta: ExecutorMeta,
}

pub struct Executor<A> {
    writer: Mutex<Writer>,
    committed: RwLock<Committed<A>>,
    cursor: AtomicU64,
    processed_inputs: AtomicU64,
    faulted: AtomicBool,
    config: ExecutorConfig,
}

/// `keccak256(prev || tx)`: links every accepted transaction to the one
/// before it.
pub fn chain_log_hash(prev: B256, tx: &[u8]) -> B256 {
    let mut preimage = Vec::with_capacity(32 + tx.len());
    preimage.extend_from_slice(prev.as_slice());
    preimage.extend_from_slice(tx);
    keccak256(preimage)
}

impl<A: Application> Executor<A> {
    /// Opens (or creates) the executor database and recovers the committed
    /// state on top of `genesis`.
    pub fn open(
        path: &str,
        synchronous: &str,
        genesis: A,
        config: ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        let mut storage = ExecutorStorage::open(path, synchronous)?;
        let meta = storage.load_meta()?;
        let app = recover(&mut storage, &meta, genesis)?;

        info!(
            cursor = meta.cursor,
            processed_inputs = meta.processed_inputs,
            "executor recovered"
        );

        Ok(Self {
            writer: Mutex::new(Writer { storage, meta }),
            committed: RwLock::new(Committed {
                app,
                cursor: meta.cursor,
            }),
            cursor: AtomicU64::new(meta.cursor),
            processed_inputs: AtomicU64::new(meta.processed_inputs),
            faulted: AtomicBool::new(false),
            config,
        })
    }

    /// Validates and applies `tx`, the ordered input at position `input`
    /// (0-based). Invalid input is consumed without moving the cursor and is
    /// not an error. Any `input` other than `processed_inputs()` is refused.
    pub fn execute(&self, input: u64, tx: &Transaction) -> Result<Cursor, ExecutorError> {
        let mut guard = self.lock_writer()?;
        let writer = &mut *guard;
        self.ensure_healthy()?;
        if input != writer.meta.processed_inputs {
            return Err(ExecutorError::OutOfOrder {
                expected: writer.meta.processed_inputs,
                actual: input,
            });
        }

        let verdict = {
            let committed = self
                .committed
                .read()
                .map_err(|_| ExecutorError::Faulted)?;
            committed.app.validate(tx.as_bytes())
        };

        if let Err(reason) = verdict {
            let next = writer.storage.commit_rejected(&writer.meta)?;
            writer.meta = next;
            self.processed_inputs
                .store(next.processed_inputs, Ordering::Release);
            debug!(
                tx_hash = %tx.hash(),
                cursor = next.cursor,
                %reason,
                "transaction rejected"
            );
            return Ok(Cursor(next.cursor));
        }

        let log_hash = chain_log_hash(writer.meta.log_hash, tx.as_bytes());
        let next = writer
            .storage
            .commit_accepted(&writer.meta, tx.as_bytes(), log_hash)?;
        writer.meta = next;

        {
            let mut committed = self.committed.write().map_err(|_| {
                self.faulted.store(true, Ordering::Release);
                ExecutorError::Faulted
            })?;
            if let Err(source) = committed.app.apply_valid(tx.as_bytes()) {
                self.faulted.store(true, Ordering::Release);
                return Err(ExecutorError::Apply {
                    cursor: next.cursor,
                    source,
                });
            }
            committed.cursor = next.cursor;
        }
        self.cursor.store(next.cursor, Ordering::Release);
        self.processed_inputs
            .store(next.processed_inputs, Ordering::Release);

        if self.config.snapshot_interval > 0 && next.cursor % self.config.snapshot_interval == 0 {
            self.write_snapshot(writer);
        }

        Ok(Cursor(next.cursor))
    }

    /// Runs a read-only query against the committed state and reports the
    /// cursor it was answered at.
    pub fn query(&self, query: &[u8]) -> Result<(Vec<u8>, Cursor), ExecutorError> {
        self.ensure_healthy()?;
        let committed = self
            .committed
            .read()
            .map_err(|_| ExecutorError::Faulted)?;
        let response = committed
            .app
            .query(query)
            .map_err(|source| ExecutorError::InvalidQuery { source })?;
        Ok((response, Cursor(committed.cursor)))
    }

    pub fn cursor(&self) -> Cursor {
        Cursor(self.cursor.load(Ordering::Acquire))
    }

    pub fn processed_inputs(&self) -> u64 {
        self.processed_inputs.load(Ordering::Acquire)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Head of the committed log, including the chained hash.
    pub fn head(&self) -> Result<ExecutorMeta, ExecutorError> {
        Ok(self.lock_writer()?.meta)
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Writer>, ExecutorError> {
        self.writer.lock().map_err(|_| ExecutorError::Faulted)
    }

    fn ensure_healthy(&self) -> Result<(), ExecutorError> {
        if self.is_faulted() {
            return Err(ExecutorError::Faulted);
        }
        Ok(())
    }

    fn write_snapshot(&self, writer: &mut Writer) {
        let state = match self.committed.read() {
            Ok(committed) => committed.app.encode_state(),
            Err(_) => return,
        };
        let meta = writer.meta;
        match writer
            .storage
            .write_snapshot(meta.cursor, meta.log_hash, state.as_slice())
        {
            Ok(()) => debug!(cursor = meta.cursor, bytes = state.len(), "snapshot written"),
            Err(err) => warn!(cursor = meta.cursor, error = %err, "snapshot write failed"),
        }
    }
}

fn recover<A: Application>(
    storage: &mut ExecutorStorage,
    meta: &ExecutorMeta,
    genesis: A,
) -> Result<A, ExecutorError> {
    let (mut app, mut cursor, mut log_hash) = match storage.load_latest_snapshot()? {
        Some(snapshot) => {
            if snapshot.cursor > meta.cursor {
                return Err(ExecutorError::CorruptedLog {
                    cursor: snapshot.cursor,
                    reason: format!("snapshot is ahead of committed head {}", meta.cursor),
                });
            }
            let app = A::restore_state(snapshot.state.as_slice()).map_err(|source| {
                ExecutorError::Recovery {
                    cursor: snapshot.cursor,
                    source,
                }
            })?;
            (app, snapshot.cursor, snapshot.log_hash)
        }
        None => (genesis, 0, B256::ZERO),
    };
    let replay_from = cursor;

    for row in storage.load_executed_from(cursor)? {
        let expected = cursor.saturating_add(1);
        if row.cursor != expected {
            return Err(ExecutorError::CorruptedLog {
                cursor: row.cursor,
                reason: format!("expected cursor {expected}"),
            });
        }
        let computed = chain_log_hash(log_hash, row.tx.as_slice());
        if computed != row.log_hash {
            return Err(ExecutorError::CorruptedLog {
                cursor: row.cursor,
                reason: "log hash chain mismatch".to_string(),
            });
        }
        app.apply_valid(row.tx.as_slice())
            .map_err(|source| ExecutorError::Apply {
                cursor: row.cursor,
                source,
            })?;
        cursor = row.cursor;
        log_hash = computed;
    }

    if cursor != meta.cursor || log_hash != meta.log_hash {
        return Err(ExecutorError::CorruptedLog {
            cursor,
            reason: format!("replay ended before committed head {}", meta.cursor),
        });
    }

    debug!(
        replay_from,
        replayed = cursor - replay_from,
        "executor log replayed"
    );
    Ok(app)
}
