// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rusqlite::{Connection, Result, Transaction, TransactionBehavior};
use rusqlite_migration::{M, Migrations};
use std::time::SystemTime;

use super::sql::{
    BatchRow, OrderedTxRow, sql_insert_accepted_tx, sql_insert_batch, sql_insert_ordered_tx,
    sql_insert_proposal, sql_mark_accepted_ordered, sql_select_decided_round,
    sql_select_latest_batch_end, sql_select_max_proposal_round_for_origin,
    sql_select_next_ordered_seq, sql_select_next_unconfirmed_batch,
    sql_select_ordered_bytes_range, sql_select_ordered_page, sql_select_ordered_range,
    sql_select_ordered_seq_by_hash, sql_select_proposals_from_round,
    sql_select_unordered_accepted, sql_update_batch_confirmed, sql_update_batch_submitted,
    sql_update_decided_round,
};
use super::{
    BatchHead, ProposalRow, StorageOpenError, StoredBatch, StoredBatchError, from_unix_ms,
    i64_to_u64, now_unix_ms, open_connection, to_unix_ms, u64_to_i64,
};
use app_core::{OrderedTx, Transaction as L2Tx};

const MIGRATION_0001_SEQUENCER_SCHEMA: &str = include_str!("migrations/0001_sequencer_schema.sql");

/// Ordering-side database: accepted writes, the ordered log, batches and
/// multi-leader proposals.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let mut conn = open_connection(path, synchronous)?;
        Self::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageOpenError> {
        Migrations::new(vec![M::up(MIGRATION_0001_SEQUENCER_SCHEMA)]).to_latest(conn)?;
        Ok(())
    }

    /// Durably records a producer write. Returns `false` when the same
    /// transaction was already accepted or is already ordered.
    pub fn accept_tx(&mut self, tx: &L2Tx) -> Result<bool> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if sql_select_ordered_seq_by_hash(&db_tx, tx.hash().as_slice())?.is_some() {
            return Ok(false);
        }
        let inserted =
            sql_insert_accepted_tx(&db_tx, tx.hash().as_slice(), tx.as_bytes(), now_unix_ms())?;
        db_tx.commit()?;
        Ok(inserted == 1)
    }

    /// Accepted writes not yet seen in the ordered log, oldest first.
    pub fn load_unordered_accepted(
        &mut self,
        accepted_before: SystemTime,
        limit: usize,
    ) -> Result<Vec<L2Tx>> {
        let rows = sql_select_unordered_accepted(
            &self.conn,
            to_unix_ms(accepted_before),
            u64_to_i64(limit as u64),
        )?;
        Ok(rows.into_iter().map(L2Tx::new).collect())
    }

    pub fn next_ordered_seq(&mut self) -> Result<u64> {
        let value = sql_select_next_ordered_seq(&self.conn)?;
        Ok(i64_to_u64(value))
    }

    /// Appends `tx` at the head of the ordered log. Returns `None` when a
    /// transaction with the same hash is already ordered.
    pub fn append_ordered(&mut self, tx: &L2Tx) -> Result<Option<u64>> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq = append_ordered_in(&db_tx, tx)?;
        db_tx.commit()?;
        Ok(seq)
    }

    /// Mirrors an entry decided elsewhere. `seq` must be the current head.
    pub fn insert_ordered_at(&mut self, seq: u64, tx: &L2Tx) -> Result<()> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = i64_to_u64(sql_select_next_ordered_seq(&db_tx)?);
        assert_eq!(
            seq, next,
            "ordered log must grow contiguously: expected {next}, got {seq}"
        );
        sql_insert_ordered_tx(
            &db_tx,
            u64_to_i64(seq),
            tx.hash().as_slice(),
            tx.as_bytes(),
        )?;
        sql_mark_accepted_ordered(&db_tx, u64_to_i64(seq), tx.hash().as_slice())?;
        db_tx.commit()?;
        Ok(())
    }

    /// Appends up to `limit` entries starting at `from_inclusive`.
    pub fn fill_ordered_txs(
        &mut self,
        from_inclusive: u64,
        limit: usize,
        out: &mut Vec<OrderedTx>,
    ) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        let rows = sql_select_ordered_page(
            &self.conn,
            u64_to_i64(from_inclusive),
            u64_to_i64(limit as u64),
        )?;
        push_contiguous(rows, from_inclusive, out);
        Ok(())
    }

    /// Loads the half-open range `[from_inclusive, to_exclusive)`; the range
    /// must already be fully ordered.
    pub fn load_ordered_range(
        &mut self,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> Result<Vec<OrderedTx>> {
        assert!(
            from_inclusive <= to_exclusive,
            "invalid ordered interval [{from_inclusive}, {to_exclusive})"
        );
        let rows = sql_select_ordered_range(
            &self.conn,
            u64_to_i64(from_inclusive),
            u64_to_i64(to_exclusive),
        )?;
        let mut out = Vec::with_capacity(rows.len());
        push_contiguous(rows, from_inclusive, &mut out);
        assert_eq!(
            from_inclusive.saturating_add(out.len() as u64),
            to_exclusive,
            "ordered interval [{from_inclusive}, {to_exclusive}) not fully populated"
        );
        Ok(out)
    }

    /// Rebuilds the open batch: everything delivered after the last closed
    /// batch and before `delivered_end`.
    pub fn load_open_batch(&mut self, delivered_end: u64) -> Result<BatchHead> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let first_seq = i64_to_u64(sql_select_latest_batch_end(&db_tx)?);
        assert!(
            first_seq <= delivered_end,
            "closed batches end at {first_seq}, beyond delivered head {delivered_end}"
        );
        let byte_count = i64_to_u64(sql_select_ordered_bytes_range(
            &db_tx,
            u64_to_i64(first_seq),
            u64_to_i64(delivered_end),
        )?);
        db_tx.commit()?;
        Ok(BatchHead {
            first_seq,
            created_at: SystemTime::now(),
            tx_count: delivered_end - first_seq,
            byte_count,
        })
    }

    pub fn close_batch(&mut self, head: &mut BatchHead) -> Result<()> {
        assert!(!head.is_empty(), "cannot close an empty batch");
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let latest_end = i64_to_u64(sql_select_latest_batch_end(&db_tx)?);
        assert_eq!(
            latest_end, head.first_seq,
            "stale BatchHead: expected first_seq {latest_end}"
        );
        let now_ms = now_unix_ms();
        sql_insert_batch(
            &db_tx,
            u64_to_i64(head.first_seq),
            u64_to_i64(head.end_seq()),
            now_ms,
        )?;
        db_tx.commit()?;
        head.move_to_next_batch(from_unix_ms(now_ms));
        Ok(())
    }

    /// Oldest closed batch without a confirmed DA cursor.
    pub fn next_unconfirmed_batch(&mut self) -> Result<Option<StoredBatch>> {
        let row = sql_select_next_unconfirmed_batch(&self.conn)?;
        Ok(row.map(stored_batch_from_row))
    }

    pub fn mark_batch_submitted(&mut self, batch_index: u64, at: SystemTime) -> Result<()> {
        let changed = sql_update_batch_submitted(&self.conn, u64_to_i64(batch_index), to_unix_ms(at))?;
        if changed != 1 {
            return Err(rusqlite::Error::StatementChangedRows(changed));
        }
        Ok(())
    }

    pub fn mark_batch_confirmed(
        &mut self,
        batch_index: u64,
        da_cursor: u64,
    ) -> std::result::Result<(), StoredBatchError> {
        let changed =
            sql_update_batch_confirmed(&self.conn, u64_to_i64(batch_index), u64_to_i64(da_cursor))?;
        if changed != 1 {
            return Err(StoredBatchError::NotPending { batch_index });
        }
        Ok(())
    }

    /// Stores a round proposal. Returns `false` if one from `origin` for
    /// `round` is already present.
    pub fn store_proposal(&mut self, round: u64, origin: u64, txs: &[u8]) -> Result<bool> {
        let inserted =
            sql_insert_proposal(&self.conn, u64_to_i64(round), u64_to_i64(origin), txs)?;
        Ok(inserted == 1)
    }

    pub fn load_proposals_from(&mut self, round: u64) -> Result<Vec<ProposalRow>> {
        let rows = sql_select_proposals_from_round(&self.conn, u64_to_i64(round))?;
        Ok(rows
            .into_iter()
            .map(|row| ProposalRow {
                round: i64_to_u64(row.round),
                origin: i64_to_u64(row.origin),
                txs: row.txs,
            })
            .collect())
    }

    pub fn max_proposal_round(&mut self, origin: u64) -> Result<Option<u64>> {
        let value = sql_select_max_proposal_round_for_origin(&self.conn, u64_to_i64(origin))?;
        Ok(value.map(i64_to_u64))
    }

    /// First round not yet folded into the ordered log.
    pub fn decided_round(&mut self) -> Result<u64> {
        let value = sql_select_decided_round(&self.conn)?;
        Ok(i64_to_u64(value))
    }

    /// Appends a decided round and advances `decided_round` past it in one
    /// transaction. Returns the sequence numbers assigned; duplicates are
    /// skipped.
    pub fn commit_decided_round(&mut self, round: u64, txs: &[L2Tx]) -> Result<Vec<u64>> {
        let db_tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let decided = i64_to_u64(sql_select_decided_round(&db_tx)?);
        assert_eq!(
            decided, round,
            "rounds must be decided in order: expected {decided}, got {round}"
        );
        let mut assigned = Vec::with_capacity(txs.len());
        for tx in txs {
            if let Some(seq) = append_ordered_in(&db_tx, tx)? {
                assigned.push(seq);
            }
        }
        sql_update_decided_round(&db_tx, u64_to_i64(round.saturating_add(1)))?;
        db_tx.commit()?;
        Ok(assigned)
    }
}

fn append_ordered_in(db_tx: &Transaction<'_>, tx: &L2Tx) -> Result<Option<u64>> {
    let hash = tx.hash();
    if sql_select_ordered_seq_by_hash(db_tx, hash.as_slice())?.is_some() {
        return Ok(None);
    }
    let seq = sql_select_next_ordered_seq(db_tx)?;
    sql_insert_ordered_tx(db_tx, seq, hash.as_slice(), tx.as_bytes())?;
    sql_mark_accepted_ordered(db_tx, seq, hash.as_slice())?;
    Ok(Some(i64_to_u64(seq)))
}

fn push_contiguous(rows: Vec<OrderedTxRow>, from_inclusive: u64, out: &mut Vec<OrderedTx>) {
    for (offset, row) in rows.into_iter().enumerate() {
        let seq = i64_to_u64(row.seq);
        let expected = from_inclusive.saturating_add(offset as u64);
        assert_eq!(
            seq, expected,
            "non-contiguous ordered seq: expected {expected}, found {seq}"
        );
        out.push(OrderedTx {
            seq,
            tx: L2Tx::new(row.tx),
        });
    }
}

fn stored_batch_from_row(row: BatchRow) -> StoredBatch {
    StoredBatch {
        batch_index: i64_to_u64(row.batch_index),
        first_seq: i64_to_u64(row.first_seq),
        end_seq: i64_to_u64(row.end_seq),
        submitted_at: row.submitted_at_ms.map(from_unix_ms),
        da_cursor: row.da_cursor.map(i64_to_u64),
    }
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use app_core::Transaction as L2Tx;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn open_temp(name: &str) -> (TempDir, Storage) {
        let dir = tempfile::Builder::new()
            .prefix(format!("sequencer-{name}-").as_str())
            .tempdir()
            .expect("create temp dir");
        let path = dir.path().join("sequencer.sqlite");
        let storage =
            Storage::open(path.to_string_lossy().as_ref(), "NORMAL").expect("open storage");
        (dir, storage)
    }

    fn tx(byte: u8) -> L2Tx {
        L2Tx::new(vec![byte; 4])
    }

    #[test]
    fn accepted_writes_leave_the_pending_set_once_ordered() {
        let (_dir, mut storage) = open_temp("accept");
        let later = SystemTime::now() + Duration::from_secs(60);

        assert!(storage.accept_tx(&tx(1)).expect("accept"));
        assert!(!storage.accept_tx(&tx(1)).expect("accept duplicate"));
        assert!(storage.accept_tx(&tx(2)).expect("accept"));
        assert_eq!(
            storage
                .load_unordered_accepted(later, 10)
                .expect("pending")
                .len(),
            2
        );

        assert_eq!(storage.append_ordered(&tx(1)).expect("append"), Some(0));
        let pending = storage.load_unordered_accepted(later, 10).expect("pending");
        assert_eq!(pending, vec![tx(2)]);

        // Already ordered: re-accepting is a no-op.
        assert!(!storage.accept_tx(&tx(1)).expect("accept ordered"));
    }

    #[test]
    fn ordered_log_skips_duplicate_hashes() {
        let (_dir, mut storage) = open_temp("dedup");
        assert_eq!(storage.append_ordered(&tx(1)).expect("append"), Some(0));
        assert_eq!(storage.append_ordered(&tx(2)).expect("append"), Some(1));
        assert_eq!(storage.append_ordered(&tx(1)).expect("append dup"), None);
        assert_eq!(storage.next_ordered_seq().expect("next"), 2);

        let range = storage.load_ordered_range(0, 2).expect("range");
        assert_eq!(range[0].tx, tx(1));
        assert_eq!(range[1].seq, 1);

        let mut page = Vec::new();
        storage.fill_ordered_txs(1, 10, &mut page).expect("page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].tx, tx(2));
    }

    #[test]
    fn insert_ordered_at_mirrors_the_leader() {
        let (_dir, mut storage) = open_temp("mirror");
        storage.insert_ordered_at(0, &tx(5)).expect("insert 0");
        storage.insert_ordered_at(1, &tx(6)).expect("insert 1");
        assert_eq!(storage.next_ordered_seq().expect("next"), 2);
    }

    #[test]
    #[should_panic(expected = "ordered log must grow contiguously")]
    fn insert_ordered_at_rejects_gaps() {
        let (_dir, mut storage) = open_temp("gap");
        let _ = storage.insert_ordered_at(3, &tx(5));
    }

    #[test]
    fn batches_close_contiguously_and_confirm_in_order() {
        let (_dir, mut storage) = open_temp("batches");
        for byte in 0..5 {
            storage.append_ordered(&tx(byte)).expect("append");
        }

        let mut head = storage.load_open_batch(3).expect("open batch");
        assert_eq!(head.first_seq, 0);
        assert_eq!(head.tx_count, 3);
        assert_eq!(head.byte_count, 12);

        storage.close_batch(&mut head).expect("close batch");
        assert_eq!(head.first_seq, 3);
        assert!(head.is_empty());

        head.record_delivered(4);
        head.record_delivered(4);
        storage.close_batch(&mut head).expect("close second batch");

        let first = storage
            .next_unconfirmed_batch()
            .expect("select")
            .expect("first batch");
        assert_eq!((first.first_seq, first.end_seq), (0, 3));
        assert!(first.submitted_at.is_none());

        storage
            .mark_batch_submitted(first.batch_index, SystemTime::now())
            .expect("mark submitted");
        storage
            .mark_batch_confirmed(first.batch_index, 1)
            .expect("confirm");
        assert!(storage.mark_batch_confirmed(first.batch_index, 2).is_err());

        let second = storage
            .next_unconfirmed_batch()
            .expect("select")
            .expect("second batch");
        assert_eq!((second.first_seq, second.end_seq), (3, 5));

        let reopened = storage.load_open_batch(5).expect("reopen");
        assert!(reopened.is_empty());
        assert_eq!(reopened.first_seq, 5);
    }

    #[test]
    fn decided_rounds_append_and_advance_atomically() {
        let (_dir, mut storage) = open_temp("rounds");
        assert!(storage.store_proposal(0, 2, &[0x01]).expect("store"));
        assert!(!storage.store_proposal(0, 2, &[0x02]).expect("store dup"));
        assert!(storage.store_proposal(0, 1, &[0x03]).expect("store"));
        assert_eq!(storage.max_proposal_round(2).expect("max"), Some(0));
        assert_eq!(storage.max_proposal_round(9).expect("max"), None);

        let proposals = storage.load_proposals_from(0).expect("load");
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].origin, 1);
        assert_eq!(proposals[1].txs, vec![0x01]);

        let seqs = storage
            .commit_decided_round(0, &[tx(1), tx(2), tx(1)])
            .expect("commit round");
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(storage.decided_round().expect("decided"), 1);

        let seqs = storage
            .commit_decided_round(1, &[])
            .expect("commit empty round");
        assert!(seqs.is_empty());
        assert_eq!(storage.decided_round().expect("decided"), 2);
    }
}
