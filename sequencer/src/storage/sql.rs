// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rusqlite::{Connection, OptionalExtension, Result, Row, Transaction, params};

const SQL_INSERT_ACCEPTED_TX: &str = "INSERT OR IGNORE INTO accepted_txs (tx_hash, tx, accepted_at_ms) VALUES (?1, ?2, ?3)";
const SQL_SELECT_UNORDERED_ACCEPTED: &str = "SELECT tx FROM accepted_txs \
     WHERE ordered_seq IS NULL AND accepted_at_ms <= ?1 ORDER BY accept_id ASC LIMIT ?2";
const SQL_MARK_ACCEPTED_ORDERED: &str =
    "UPDATE accepted_txs SET ordered_seq = ?1 WHERE tx_hash = ?2 AND ordered_seq IS NULL";
const SQL_SELECT_NEXT_ORDERED_SEQ: &str = "SELECT COALESCE(MAX(seq) + 1, 0) FROM ordered_txs";
const SQL_SELECT_ORDERED_SEQ_BY_HASH: &str = "SELECT seq FROM ordered_txs WHERE tx_hash = ?1";
const SQL_INSERT_ORDERED_TX: &str =
    "INSERT INTO ordered_txs (seq, tx_hash, tx) VALUES (?1, ?2, ?3)";
const SQL_SELECT_ORDERED_RANGE: &str =
    "SELECT seq, tx FROM ordered_txs WHERE seq >= ?1 AND seq < ?2 ORDER BY seq ASC";
const SQL_SELECT_ORDERED_PAGE: &str =
    "SELECT seq, tx FROM ordered_txs WHERE seq >= ?1 ORDER BY seq ASC LIMIT ?2";
const SQL_SELECT_ORDERED_BYTES_RANGE: &str =
    "SELECT COALESCE(SUM(LENGTH(tx)), 0) FROM ordered_txs WHERE seq >= ?1 AND seq < ?2";
const SQL_SELECT_LATEST_BATCH_END: &str = "SELECT COALESCE(MAX(end_seq), 0) FROM batches";
const SQL_INSERT_BATCH: &str =
    "INSERT INTO batches (first_seq, end_seq, created_at_ms) VALUES (?1, ?2, ?3)";
const SQL_SELECT_NEXT_UNCONFIRMED_BATCH: &str = "SELECT batch_index, first_seq, end_seq, \
     submitted_at_ms, da_cursor FROM batches WHERE da_cursor IS NULL ORDER BY batch_index ASC LIMIT 1";
const SQL_UPDATE_BATCH_SUBMITTED: &str =
    "UPDATE batches SET submitted_at_ms = ?2 WHERE batch_index = ?1";
const SQL_UPDATE_BATCH_CONFIRMED: &str =
    "UPDATE batches SET da_cursor = ?2 WHERE batch_index = ?1 AND da_cursor IS NULL";
const SQL_INSERT_PROPOSAL: &str =
    "INSERT OR IGNORE INTO proposals (round, origin, txs) VALUES (?1, ?2, ?3)";
const SQL_SELECT_PROPOSALS_FROM_ROUND: &str =
    "SELECT round, origin, txs FROM proposals WHERE round >= ?1 ORDER BY round ASC, origin ASC";
const SQL_SELECT_MAX_PROPOSAL_ROUND_FOR_ORIGIN: &str =
    "SELECT MAX(round) FROM proposals WHERE origin = ?1";
const SQL_SELECT_DECIDED_ROUND: &str =
    "SELECT decided_round FROM ordering_meta WHERE singleton_id = 0";
const SQL_UPDATE_DECIDED_ROUND: &str =
    "UPDATE ordering_meta SET decided_round = ?1 WHERE singleton_id = 0";

#[derive(Debug, Clone)]
pub(super) struct OrderedTxRow {
    pub seq: i64,
    pub tx: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(super) struct BatchRow {
    pub batch_index: i64,
    pub first_seq: i64,
    pub end_seq: i64,
    pub submitted_at_ms: Option<i64>,
    pub da_cursor: Option<i64>,
}

#[derive(Debug, Clone)]
pub(super) struct ProposalSqlRow {
    pub round: i64,
    pub origin: i64,
    pub txs: Vec<u8>,
}

pub(super) fn sql_insert_accepted_tx(
    conn: &Connection,
    tx_hash: &[u8],
    tx: &[u8],
    accepted_at_ms: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(SQL_INSERT_ACCEPTED_TX)?;
    stmt.execute(params![tx_hash, tx, accepted_at_ms])
}

pub(super) fn sql_select_unordered_accepted(
    conn: &Connection,
    accepted_before_ms: i64,
    limit: i64,
) -> Result<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_UNORDERED_ACCEPTED)?;
    let mapped = stmt.query_map(params![accepted_before_ms, limit], |row| row.get(0))?;
    mapped.collect()
}

pub(super) fn sql_mark_accepted_ordered(
    tx: &Transaction<'_>,
    seq: i64,
    tx_hash: &[u8],
) -> Result<usize> {
    let mut stmt = tx.prepare_cached(SQL_MARK_ACCEPTED_ORDERED)?;
    stmt.execute(params![seq, tx_hash])
}

pub(super) fn sql_select_next_ordered_seq(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_NEXT_ORDERED_SEQ, [], |row| row.get(0))
}

pub(super) fn sql_select_ordered_seq_by_hash(
    conn: &Connection,
    tx_hash: &[u8],
) -> Result<Option<i64>> {
    conn.query_row(SQL_SELECT_ORDERED_SEQ_BY_HASH, params![tx_hash], |row| {
        row.get(0)
    })
    .optional()
}

pub(super) fn sql_insert_ordered_tx(
    tx: &Transaction<'_>,
    seq: i64,
    tx_hash: &[u8],
    payload: &[u8],
) -> Result<()> {
    let mut stmt = tx.prepare_cached(SQL_INSERT_ORDERED_TX)?;
    stmt.execute(params![seq, tx_hash, payload])?;
    Ok(())
}

pub(super) fn sql_select_ordered_range(
    conn: &Connection,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<Vec<OrderedTxRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_ORDERED_RANGE)?;
    let mapped = stmt.query_map(
        params![from_inclusive, to_exclusive],
        convert_row_to_ordered_tx_row,
    )?;
    mapped.collect()
}

pub(super) fn sql_select_ordered_page(
    conn: &Connection,
    from_inclusive: i64,
    limit: i64,
) -> Result<Vec<OrderedTxRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_ORDERED_PAGE)?;
    let mapped = stmt.query_map(params![from_inclusive, limit], convert_row_to_ordered_tx_row)?;
    mapped.collect()
}

pub(super) fn sql_select_ordered_bytes_range(
    conn: &Connection,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<i64> {
    conn.query_row(
        SQL_SELECT_ORDERED_BYTES_RANGE,
        params![from_inclusive, to_exclusive],
        |row| row.get(0),
    )
}

pub(super) fn sql_select_latest_batch_end(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_LATEST_BATCH_END, [], |row| row.get(0))
}

pub(super) fn sql_insert_batch(
    tx: &Transaction<'_>,
    first_seq: i64,
    end_seq: i64,
    created_at_ms: i64,
) -> Result<usize> {
    tx.execute(SQL_INSERT_BATCH, params![first_seq, end_seq, created_at_ms])
}

pub(super) fn sql_select_next_unconfirmed_batch(conn: &Connection) -> Result<Option<BatchRow>> {
    conn.query_row(SQL_SELECT_NEXT_UNCONFIRMED_BATCH, [], convert_row_to_batch_row)
        .optional()
}

pub(super) fn sql_update_batch_submitted(
    conn: &Connection,
    batch_index: i64,
    submitted_at_ms: i64,
) -> Result<usize> {
    conn.execute(
        SQL_UPDATE_BATCH_SUBMITTED,
        params![batch_index, submitted_at_ms],
    )
}

pub(super) fn sql_update_batch_confirmed(
    conn: &Connection,
    batch_index: i64,
    da_cursor: i64,
) -> Result<usize> {
    conn.execute(SQL_UPDATE_BATCH_CONFIRMED, params![batch_index, da_cursor])
}

pub(super) fn sql_insert_proposal(
    conn: &Connection,
    round: i64,
    origin: i64,
    txs: &[u8],
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(SQL_INSERT_PROPOSAL)?;
    stmt.execute(params![round, origin, txs])
}

pub(super) fn sql_select_proposals_from_round(
    conn: &Connection,
    round: i64,
) -> Result<Vec<ProposalSqlRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_PROPOSALS_FROM_ROUND)?;
    let mapped = stmt.query_map(params![round], |row| {
        Ok(ProposalSqlRow {
            round: row.get(0)?,
            origin: row.get(1)?,
            txs: row.get(2)?,
        })
    })?;
    mapped.collect()
}

pub(super) fn sql_select_max_proposal_round_for_origin(
    conn: &Connection,
    origin: i64,
) -> Result<Option<i64>> {
    conn.query_row(
        SQL_SELECT_MAX_PROPOSAL_ROUND_FOR_ORIGIN,
        params![origin],
        |row| row.get(0),
    )
}

pub(super) fn sql_select_decided_round(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_DECIDED_ROUND, [], |row| row.get(0))
}

pub(super) fn sql_update_decided_round(tx: &Transaction<'_>, round: i64) -> Result<usize> {
    tx.execute(SQL_UPDATE_DECIDED_ROUND, params![round])
}

fn convert_row_to_ordered_tx_row(row: &Row<'_>) -> Result<OrderedTxRow> {
    Ok(OrderedTxRow {
        seq: row.get(0)?,
        tx: row.get(1)?,
    })
}

fn convert_row_to_batch_row(row: &Row<'_>) -> Result<BatchRow> {
    Ok(BatchRow {
        batch_index: row.get(0)?,
        first_seq: row.get(1)?,
        end_seq: row.get(2)?,
        submitted_at_ms: row.get(3)?,
        da_cursor: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        SQL_INSERT_ORDERED_TX, sql_insert_accepted_tx, sql_insert_batch,
        sql_select_decided_round, sql_select_latest_batch_end, sql_select_next_ordered_seq,
        sql_select_next_unconfirmed_batch, sql_select_ordered_bytes_range,
        sql_select_ordered_page, sql_select_unordered_accepted,
    };
    use crate::storage::db::Storage;
    use rusqlite::{Connection, params};

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
        Storage::run_migrations(&mut conn).expect("run migrations");
        conn
    }

    #[test]
    fn accepted_insert_is_idempotent_by_hash() {
        let conn = setup_conn();
        assert_eq!(
            sql_insert_accepted_tx(&conn, &[0x01; 32], &[0xaa], 10).expect("insert"),
            1
        );
        assert_eq!(
            sql_insert_accepted_tx(&conn, &[0x01; 32], &[0xaa], 11).expect("insert again"),
            0
        );

        let pending = sql_select_unordered_accepted(&conn, i64::MAX, 10).expect("select");
        assert_eq!(pending, vec![vec![0xaa_u8]]);
        let too_early = sql_select_unordered_accepted(&conn, 5, 10).expect("select");
        assert!(too_early.is_empty());
    }

    #[test]
    fn ordered_helpers_page_and_sum() {
        let conn = setup_conn();
        assert_eq!(sql_select_next_ordered_seq(&conn).expect("next"), 0);

        for seq in 0..3_i64 {
            conn.execute(
                SQL_INSERT_ORDERED_TX,
                params![seq, vec![seq as u8; 32], vec![0xcc_u8; (seq + 1) as usize]],
            )
            .expect("insert ordered");
        }

        assert_eq!(sql_select_next_ordered_seq(&conn).expect("next"), 3);
        let page = sql_select_ordered_page(&conn, 1, 10).expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seq, 1);
        assert_eq!(sql_select_ordered_bytes_range(&conn, 0, 3).expect("bytes"), 6);
    }

    #[test]
    fn batch_helpers_track_latest_end_and_unconfirmed() {
        let mut conn = setup_conn();
        assert_eq!(sql_select_latest_batch_end(&conn).expect("end"), 0);
        assert!(
            sql_select_next_unconfirmed_batch(&conn)
                .expect("select")
                .is_none()
        );

        let tx = conn.transaction().expect("start tx");
        sql_insert_batch(&tx, 0, 4, 1).expect("insert batch");
        sql_insert_batch(&tx, 4, 6, 2).expect("insert batch");
        tx.commit().expect("commit");

        assert_eq!(sql_select_latest_batch_end(&conn).expect("end"), 6);
        let next = sql_select_next_unconfirmed_batch(&conn)
            .expect("select")
            .expect("some batch");
        assert_eq!((next.first_seq, next.end_seq), (0, 4));
        assert_eq!(next.da_cursor, None);
    }

    #[test]
    fn decided_round_starts_at_zero() {
        let conn = setup_conn();
        assert_eq!(sql_select_decided_round(&conn).expect("decided round"), 0);
    }
}
