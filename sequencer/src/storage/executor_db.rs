// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::B256;
use rusqlite::{Connection, OptionalExtension, Result, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{StorageOpenError, i64_to_u64, open_connection, u64_to_i64};

const MIGRATION_0001_EXECUTOR_SCHEMA: &str = include_str!("migrations/0001_executor_schema.sql");

const SQL_SELECT_META: &str =
    "SELECT cursor, processed_inputs, log_hash FROM executor_meta WHERE singleton_id = 0";
const SQL_UPDATE_META: &str = "UPDATE executor_meta \
     SET cursor = ?1, processed_inputs = ?2, log_hash = ?3 \
     WHERE singleton_id = 0 AND cursor = ?4 AND processed_inputs = ?5";
const SQL_INSERT_EXECUTED_TX: &str =
    "INSERT INTO executed_txs (cursor, tx, log_hash) VALUES (?1, ?2, ?3)";
const SQL_SELECT_EXECUTED_AFTER: &str =
    "SELECT cursor, tx, log_hash FROM executed_txs WHERE cursor > ?1 ORDER BY cursor ASC";
const SQL_SELECT_LATEST_SNAPSHOT: &str =
    "SELECT cursor, log_hash, state FROM snapshots ORDER BY cursor DESC LIMIT 1";
const SQL_UPSERT_SNAPSHOT: &str =
    "INSERT OR REPLACE INTO snapshots (cursor, log_hash, state) VALUES (?1, ?2, ?3)";
const SQL_DELETE_SNAPSHOTS_BEFORE: &str = "DELETE FROM snapshots WHERE cursor < ?1";

/// Committed head of the executor.
///
/// `cursor` counts accepted transactions; `processed_inputs` counts every
/// ordered entry consumed, rejected ones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorMeta {
    pub cursor: u64,
    pub processed_inputs: u64,
    pub log_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub cursor: u64,
    pub log_hash: B256,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedTxRow {
    pub cursor: u64,
    pub tx: Vec<u8>,
    pub log_hash: B256,
}

pub struct ExecutorStorage {
    conn: Connection,
}

impl ExecutorStorage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let mut conn = open_connection(path, synchronous)?;
        Self::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageOpenError> {
        Migrations::new(vec![M::up(MIGRATION_0001_EXECUTOR_SCHEMA)]).to_latest(conn)?;
        Ok(())
    }

    pub fn load_meta(&mut self) -> Result<ExecutorMeta> {
        self.conn.query_row(SQL_SELECT_META, [], |row| {
            let log_hash: Vec<u8> = row.get(2)?;
            Ok(ExecutorMeta {
                cursor: i64_to_u64(row.get(0)?),
                processed_inputs: i64_to_u64(row.get(1)?),
                log_hash: blob_to_b256(log_hash.as_slice()),
            })
        })
    }

    pub fn load_latest_snapshot(&mut self) -> Result<Option<SnapshotRow>> {
        self.conn
            .query_row(SQL_SELECT_LATEST_SNAPSHOT, [], |row| {
                let log_hash: Vec<u8> = row.get(1)?;
                Ok(SnapshotRow {
                    cursor: i64_to_u64(row.get(0)?),
                    log_hash: blob_to_b256(log_hash.as_slice()),
                    state: row.get(2)?,
                })
            })
            .optional()
    }

    /// Accepted transactions with a cursor strictly greater than `after`.
    pub fn load_executed_from(&mut self, after: u64) -> Result<Vec<ExecutedTxRow>> {
        let mut stmt = self.conn.prepare_cached(SQL_SELECT_EXECUTED_AFTER)?;
        let mapped = stmt.query_map(params![u64_to_i64(after)], |row| {
            let log_hash: Vec<u8> = row.get(2)?;
            Ok(ExecutedTxRow {
                cursor: i64_to_u64(row.get(0)?),
                tx: row.get(1)?,
                log_hash: blob_to_b256(log_hash.as_slice()),
            })
        })?;
        mapped.collect()
    }

    /// Records an accepted transaction and moves the head past it in one
    /// transaction. `current` must match the stored head.
    pub fn commit_accepted(
        &mut self,
        current: &ExecutorMeta,
        tx: &[u8],
        log_hash: B256,
    ) -> Result<ExecutorMeta> {
        let next = ExecutorMeta {
            cursor: current.cursor.saturating_add(1),
            processed_inputs: current.processed_inputs.saturating_add(1),
            log_hash,
        };
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        db_tx.execute(
            SQL_INSERT_EXECUTED_TX,
            params![u64_to_i64(next.cursor), tx, log_hash.as_slice()],
        )?;
        update_meta(&db_tx, current, &next)?;
        db_tx.commit()?;
        Ok(next)
    }

    /// Consumes a rejected input: only `processed_inputs` moves.
    pub fn commit_rejected(&mut self, current: &ExecutorMeta) -> Result<ExecutorMeta> {
        let next = ExecutorMeta {
            processed_inputs: current.processed_inputs.saturating_add(1),
            ..*current
        };
        update_meta(&self.conn, current, &next)?;
        Ok(next)
    }

    /// Stores a snapshot and drops the older ones.
    pub fn write_snapshot(&mut self, cursor: u64, log_hash: B256, state: &[u8]) -> Result<()> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        db_tx.execute(
            SQL_UPSERT_SNAPSHOT,
            params![u64_to_i64(cursor), log_hash.as_slice(), state],
        )?;
        db_tx.execute(SQL_DELETE_SNAPSHOTS_BEFORE, params![u64_to_i64(cursor)])?;
        db_tx.commit()?;
        Ok(())
    }
}

fn update_meta(conn: &Connection, current: &ExecutorMeta, next: &ExecutorMeta) -> Result<()> {
    let changed = conn.execute(
        SQL_UPDATE_META,
        params![
            u64_to_i64(next.cursor),
            u64_to_i64(next.processed_inputs),
            next.log_hash.as_slice(),
            u64_to_i64(current.cursor),
            u64_to_i64(current.processed_inputs),
        ],
    )?;
    if changed != 1 {
        return Err(rusqlite::Error::StatementChangedRows(changed));
    }
    Ok(())
}

fn blob_to_b256(bytes: &[u8]) -> B256 {
    assert_eq!(bytes.len(), 32, "log hash column must hold 32 bytes");
    B256::from_slice(bytes)
}
