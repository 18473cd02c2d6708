// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod db;
mod executor_db;
mod sql;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use thiserror::Error;

pub use db::Storage;
pub use executor_db::{ExecutedTxRow, ExecutorMeta, ExecutorStorage, SnapshotRow};

#[derive(Debug, Error)]
pub enum StorageOpenError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
}

#[derive(Debug, Error)]
pub enum StoredBatchError {
    #[error("batch {batch_index} is not pending confirmation")]
    NotPending { batch_index: u64 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Open batch of the delivery lane: everything delivered since the last
/// closed batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchHead {
    pub first_seq: u64,
    pub created_at: SystemTime,
    pub tx_count: u64,
    pub byte_count: u64,
}

impl BatchHead {
    pub fn end_seq(&self) -> u64 {
        self.first_seq.saturating_add(self.tx_count)
    }

    pub fn is_empty(&self) -> bool {
        self.tx_count == 0
    }

    pub fn record_delivered(&mut self, tx_len: usize) {
        self.tx_count = self.tx_count.saturating_add(1);
        self.byte_count = self.byte_count.saturating_add(tx_len as u64);
    }

    pub fn move_to_next_batch(&mut self, created_at: SystemTime) {
        self.first_seq = self.end_seq();
        self.created_at = created_at;
        self.tx_count = 0;
        self.byte_count = 0;
    }
}

/// A closed batch as tracked by the publication lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBatch {
    pub batch_index: u64,
    pub first_seq: u64,
    pub end_seq: u64,
    pub submitted_at: Option<SystemTime>,
    pub da_cursor: Option<u64>,
}

/// A multi-leader proposal row; `txs` is the SSZ payload as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRow {
    pub round: u64,
    pub origin: u64,
    pub txs: Vec<u8>,
}

pub(crate) fn open_connection(path: &str, synchronous: &str) -> Result<Connection, StorageOpenError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", synchronous)?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

pub(crate) fn to_unix_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub(crate) fn from_unix_ms(ms: i64) -> SystemTime {
    let clamped_ms = ms.max(0) as u64;
    UNIX_EPOCH + Duration::from_millis(clamped_ms)
}

pub(crate) fn now_unix_ms() -> i64 {
    to_unix_ms(SystemTime::now())
}

pub(crate) fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn i64_to_u64(value: i64) -> u64 {
    value.max(0) as u64
}
