//! Trade Store
//!
//! Relational home of the enriched audit trail. One row per `exec_id`,
//! enforced by the primary key; redelivered records collapse into the
//! existing row via insert-if-not-exists. Every applied insert also
//! writes a `trades_history` row carrying the full payload, which is the
//! point-in-time audit surface.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::models::{EnrichedTrade, Side, TradeEnvelope};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    exec_id              TEXT PRIMARY KEY,
    order_id             TEXT NOT NULL,
    client_order_id      TEXT NOT NULL,
    symbol               TEXT NOT NULL,
    side                 INTEGER NOT NULL,
    quantity             INTEGER NOT NULL,
    price_mantissa       INTEGER NOT NULL,
    trader_id            TEXT NOT NULL,
    account              TEXT NOT NULL,
    strategy_code        TEXT NOT NULL,
    exchange             TEXT NOT NULL,
    receive_timestamp    INTEGER NOT NULL,
    gateway_timestamp    INTEGER NOT NULL,
    exec_timestamp       INTEGER NOT NULL,
    gateway_id           TEXT NOT NULL,
    raw_frame            BLOB NOT NULL,
    trader_name          TEXT,
    trader_mpid          TEXT,
    strategy_name        TEXT,
    cusip                TEXT,
    sedol                TEXT,
    isin                 TEXT,
    security_name        TEXT,
    mic                  TEXT,
    enrichment_timestamp INTEGER NOT NULL,
    inserted_at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_trades_trader ON trades(trader_id);

CREATE TABLE IF NOT EXISTS trades_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    exec_id     TEXT NOT NULL,
    op          TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    payload     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_exec ON trades_history(exec_id);
"#;

const INSERT_SQL: &str = r#"
INSERT INTO trades (
    exec_id, order_id, client_order_id, symbol, side, quantity, price_mantissa,
    trader_id, account, strategy_code, exchange,
    receive_timestamp, gateway_timestamp, exec_timestamp, gateway_id, raw_frame,
    trader_name, trader_mpid, strategy_name, cusip, sedol, isin, security_name, mic,
    enrichment_timestamp, inserted_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
          ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
"#;

/// Same columns, insert-if-not-exists.
const UPSERT_SQL: &str = r#"
INSERT INTO trades (
    exec_id, order_id, client_order_id, symbol, side, quantity, price_mantissa,
    trader_id, account, strategy_code, exchange,
    receive_timestamp, gateway_timestamp, exec_timestamp, gateway_id, raw_frame,
    trader_name, trader_mpid, strategy_name, cusip, sedol, isin, security_name, mic,
    enrichment_timestamp, inserted_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
          ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
ON CONFLICT(exec_id) DO NOTHING
"#;

/// How a batch landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Bulk,
    RowByRow,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub mode: FlushMode,
}

// =============================================================================
// STORE
// =============================================================================

pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("open trade db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA).context("apply trade schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory trade db")?;
        conn.execute_batch(SCHEMA).context("apply trade schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bulk-insert a batch in one transaction. A duplicate `exec_id`
    /// anywhere in the batch aborts the bulk attempt, and the batch is
    /// replayed row-by-row with insert-if-not-exists so at-least-once
    /// delivery never produces a second row.
    pub fn insert_batch(&self, batch: &[EnrichedTrade]) -> Result<FlushOutcome> {
        if batch.is_empty() {
            return Ok(FlushOutcome {
                inserted: 0,
                duplicates: 0,
                mode: FlushMode::Bulk,
            });
        }

        let mut conn = self.conn.lock();
        match Self::bulk(&mut conn, batch) {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_constraint_violation(&e) => {
                debug!(rows = batch.len(), "bulk_insert_duplicate_fallback");
                Self::row_by_row(&mut conn, batch)
            }
            Err(e) => Err(e).context("bulk insert"),
        }
    }

    fn bulk(conn: &mut Connection, batch: &[EnrichedTrade]) -> rusqlite::Result<FlushOutcome> {
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT_SQL)?;
            let mut history = tx.prepare_cached(
                "INSERT INTO trades_history (exec_id, op, recorded_at, payload) VALUES (?1, 'INSERT', ?2, ?3)",
            )?;
            for trade in batch {
                bind_insert(&mut insert, trade)?;
                history.execute(params![
                    trade.envelope.exec_id,
                    chrono::Utc::now().timestamp_millis(),
                    serde_json::to_string(trade).unwrap_or_default(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(FlushOutcome {
            inserted: batch.len(),
            duplicates: 0,
            mode: FlushMode::Bulk,
        })
    }

    fn row_by_row(conn: &mut Connection, batch: &[EnrichedTrade]) -> Result<FlushOutcome> {
        let tx = conn.transaction().context("row-by-row tx")?;
        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        {
            let mut upsert = tx.prepare_cached(UPSERT_SQL).context("prepare upsert")?;
            let mut history = tx
                .prepare_cached(
                    "INSERT INTO trades_history (exec_id, op, recorded_at, payload) VALUES (?1, 'INSERT', ?2, ?3)",
                )
                .context("prepare history")?;
            for trade in batch {
                let changed = bind_insert(&mut upsert, trade).context("upsert row")?;
                if changed > 0 {
                    inserted += 1;
                    history
                        .execute(params![
                            trade.envelope.exec_id,
                            chrono::Utc::now().timestamp_millis(),
                            serde_json::to_string(trade).unwrap_or_default(),
                        ])
                        .context("history row")?;
                } else {
                    duplicates += 1;
                }
            }
        }
        tx.commit().context("commit row-by-row")?;
        if duplicates > 0 {
            warn!(inserted, duplicates, "batch_contained_duplicates");
        }
        Ok(FlushOutcome {
            inserted,
            duplicates,
            mode: FlushMode::RowByRow,
        })
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: u64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .context("count trades")?;
        Ok(n)
    }

    pub fn get(&self, exec_id: &str) -> Result<Option<EnrichedTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT exec_id, order_id, client_order_id, symbol, side, quantity, price_mantissa,
                        trader_id, account, strategy_code, exchange,
                        receive_timestamp, gateway_timestamp, exec_timestamp, gateway_id, raw_frame,
                        trader_name, trader_mpid, strategy_name, cusip, sedol, isin, security_name,
                        mic, enrichment_timestamp
                 FROM trades WHERE exec_id = ?1",
            )
            .context("prepare get")?;
        let mut rows = stmt
            .query_map(params![exec_id], |row| {
                Ok(EnrichedTrade {
                    envelope: TradeEnvelope {
                        exec_id: row.get(0)?,
                        order_id: row.get(1)?,
                        client_order_id: row.get(2)?,
                        symbol: row.get(3)?,
                        side: Side::from_wire(row.get::<_, i64>(4)? as u8),
                        quantity: row.get(5)?,
                        price_mantissa: row.get(6)?,
                        trader_id: row.get(7)?,
                        account: row.get(8)?,
                        strategy_code: row.get(9)?,
                        exchange: row.get(10)?,
                        receive_timestamp: row.get::<_, i64>(11)? as u64,
                        gateway_timestamp: row.get(12)?,
                        exec_timestamp: row.get(13)?,
                        gateway_id: row.get(14)?,
                        raw_frame: row.get(15)?,
                    },
                    trader_name: row.get(16)?,
                    trader_mpid: row.get(17)?,
                    strategy_name: row.get(18)?,
                    cusip: row.get(19)?,
                    sedol: row.get(20)?,
                    isin: row.get(21)?,
                    security_name: row.get(22)?,
                    mic: row.get(23)?,
                    enrichment_timestamp: row.get(24)?,
                })
            })
            .context("query trade")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("read trade row")?)),
            None => Ok(None),
        }
    }

    /// Audit rows recorded for one exec id.
    pub fn history_count(&self, exec_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let n: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trades_history WHERE exec_id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .context("count history")?;
        Ok(n)
    }
}

fn bind_insert(
    stmt: &mut rusqlite::CachedStatement<'_>,
    trade: &EnrichedTrade,
) -> rusqlite::Result<usize> {
    let e = &trade.envelope;
    stmt.execute(params![
        e.exec_id,
        e.order_id,
        e.client_order_id,
        e.symbol,
        e.side.to_wire() as i64,
        e.quantity,
        e.price_mantissa,
        e.trader_id,
        e.account,
        e.strategy_code,
        e.exchange,
        e.receive_timestamp as i64,
        e.gateway_timestamp,
        e.exec_timestamp,
        e.gateway_id,
        e.raw_frame,
        trade.trader_name,
        trade.trader_mpid,
        trade.strategy_name,
        trade.cusip,
        trade.sedol,
        trade.isin,
        trade.security_name,
        trade.mic,
        trade.enrichment_timestamp,
        chrono::Utc::now().timestamp_millis(),
    ])
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn enriched(exec_id: &str) -> EnrichedTrade {
        EnrichedTrade {
            envelope: TradeEnvelope {
                exec_id: exec_id.into(),
                order_id: "O1".into(),
                client_order_id: "C1".into(),
                symbol: "AAPL".into(),
                side: Side::Buy,
                quantity: 100,
                price_mantissa: 15_050_000_000,
                trader_id: "T1".into(),
                account: "ACC".into(),
                strategy_code: "VWAP".into(),
                exchange: "XNAS".into(),
                receive_timestamp: 42,
                gateway_timestamp: 1_700_000_000_000,
                exec_timestamp: 1_700_000_000_001,
                raw_frame: vec![1, 2, 3],
                gateway_id: "gw".into(),
            },
            trader_name: Some("Ada".into()),
            trader_mpid: None,
            strategy_name: Some("Volume Weighted".into()),
            cusip: None,
            sedol: None,
            isin: Some("US0378331005".into()),
            security_name: Some("Apple Inc".into()),
            mic: Some("XNAS".into()),
            enrichment_timestamp: 1_700_000_000_002,
        }
    }

    #[test]
    fn bulk_insert_and_read_back() {
        let store = TradeStore::in_memory().unwrap();
        let outcome = store
            .insert_batch(&[enriched("E1"), enriched("E2")])
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.mode, FlushMode::Bulk);
        assert_eq!(store.count().unwrap(), 2);

        let row = store.get("E1").unwrap().unwrap();
        assert_eq!(row, enriched("E1"));
        assert!(store.get("E404").unwrap().is_none());
    }

    #[test]
    fn duplicate_batch_falls_back_to_upsert() {
        let store = TradeStore::in_memory().unwrap();
        store.insert_batch(&[enriched("E1")]).unwrap();

        // Redelivered batch: one duplicate, one new.
        let outcome = store
            .insert_batch(&[enriched("E1"), enriched("E2")])
            .unwrap();
        assert_eq!(outcome.mode, FlushMode::RowByRow);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn redelivery_is_idempotent() {
        let store = TradeStore::in_memory().unwrap();
        for _ in 0..5 {
            store.insert_batch(&[enriched("E5")]).unwrap();
        }
        assert_eq!(store.count().unwrap(), 1);
        // Exactly one audit row: duplicates never touch history.
        assert_eq!(store.history_count("E5").unwrap(), 1);
    }

    #[test]
    fn duplicates_within_one_batch_collapse() {
        let store = TradeStore::in_memory().unwrap();
        let outcome = store
            .insert_batch(&[enriched("E1"), enriched("E1"), enriched("E1")])
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let store = TradeStore::in_memory().unwrap();
        let outcome = store.insert_batch(&[]).unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn history_preserves_payload() {
        let store = TradeStore::in_memory().unwrap();
        store.insert_batch(&[enriched("E1")]).unwrap();
        assert_eq!(store.history_count("E1").unwrap(), 1);
        assert_eq!(store.history_count("E2").unwrap(), 0);
    }
}
