//! Append-only outcome ledger
//!
//! SQLite in WAL mode so control-plane reads never block the writer. The
//! live pipeline appends through `spawn_blocking`; nothing in the hot path
//! waits on disk.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::models::{FailureReason, OutcomeRecord, StrategyKind};

#[derive(Clone)]
pub struct OutcomeStore {
    conn: Arc<Mutex<Connection>>,
}

impl OutcomeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open outcome db {}", path.as_ref().display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outcomes (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                bundle_id       TEXT NOT NULL,
                opportunity_id  TEXT NOT NULL,
                strategy        TEXT NOT NULL,
                chain           INTEGER NOT NULL,
                inclusion_block INTEGER,
                gas_used        INTEGER NOT NULL,
                realized_profit TEXT NOT NULL,
                latency_ms      INTEGER NOT NULL,
                failure         TEXT,
                recorded_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_recorded
                ON outcomes(recorded_at DESC);
            CREATE INDEX IF NOT EXISTS idx_outcomes_strategy
                ON outcomes(strategy, recorded_at DESC);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one record. The ledger is insert-only by construction: there
    /// is no update or delete path.
    pub fn append(&self, record: &OutcomeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outcomes (bundle_id, opportunity_id, strategy, chain,
                 inclusion_block, gas_used, realized_profit, latency_ms, failure, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.bundle_id.to_string(),
                record.opportunity_id.to_string(),
                record.strategy.as_str(),
                record.chain,
                record.inclusion_block,
                record.gas_used as i64,
                record.realized_profit.to_string(),
                record.latency_ms as i64,
                record.failure.map(|f| f.as_str()),
                record.recorded_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bundle_id, opportunity_id, strategy, chain, inclusion_block,
                    gas_used, realized_profit, latency_ms, failure, recorded_at
             FROM outcomes ORDER BY recorded_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let bundle_id: String = row.get(0)?;
            let opportunity_id: String = row.get(1)?;
            let strategy: String = row.get(2)?;
            let chain: u32 = row.get(3)?;
            let inclusion_block: Option<u64> = row.get(4)?;
            let gas_used: i64 = row.get(5)?;
            let realized_profit: String = row.get(6)?;
            let latency_ms: i64 = row.get(7)?;
            let failure: Option<String> = row.get(8)?;
            let recorded_at: i64 = row.get(9)?;
            Ok((
                bundle_id,
                opportunity_id,
                strategy,
                chain,
                inclusion_block,
                gas_used,
                realized_profit,
                latency_ms,
                failure,
                recorded_at,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                bundle_id,
                opportunity_id,
                strategy,
                chain,
                inclusion_block,
                gas_used,
                realized_profit,
                latency_ms,
                failure,
                recorded_at,
            ) = row?;
            out.push(OutcomeRecord {
                bundle_id: bundle_id.parse::<Uuid>().unwrap_or_default(),
                opportunity_id: opportunity_id.parse::<Uuid>().unwrap_or_default(),
                strategy: StrategyKind::parse(&strategy).unwrap_or(StrategyKind::FlashArb),
                chain,
                inclusion_block,
                gas_used: gas_used.max(0) as u64,
                realized_profit: realized_profit.parse::<i128>().unwrap_or(0),
                latency_ms: latency_ms.max(0) as u64,
                failure: failure.as_deref().and_then(FailureReason::parse),
                recorded_at: chrono::DateTime::from_timestamp_millis(recorded_at)
                    .unwrap_or_else(chrono::Utc::now),
            });
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM outcomes", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(profit: i128) -> OutcomeRecord {
        OutcomeRecord {
            bundle_id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            strategy: StrategyKind::FlashArb,
            chain: 1,
            inclusion_block: Some(19_000_000),
            gas_used: 180_000,
            realized_profit: profit,
            latency_ms: 220,
            failure: None,
            recorded_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn append_and_read_back() {
        let store = OutcomeStore::open_in_memory().unwrap();
        let rec = record(1_500_000_000_000_000i128);
        store.append(&rec).unwrap();

        let rows = store.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bundle_id, rec.bundle_id);
        assert_eq!(rows[0].realized_profit, rec.realized_profit);
        assert!(rows[0].succeeded());
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let store = OutcomeStore::open_in_memory().unwrap();
        for profit in 0..25i128 {
            store.append(&record(profit)).unwrap();
        }
        let rows = store.recent(10).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(store.count().unwrap(), 25);
        // Newest row carries the last profit appended.
        assert_eq!(rows[0].realized_profit, 24);
    }

    #[test]
    fn negative_realized_profit_round_trips() {
        let store = OutcomeStore::open_in_memory().unwrap();
        let mut rec = record(-42);
        rec.failure = Some(FailureReason::Reverted);
        store.append(&rec).unwrap();
        let rows = store.recent(1).unwrap();
        assert_eq!(rows[0].realized_profit, -42);
        assert!(!rows[0].succeeded());
    }
}
