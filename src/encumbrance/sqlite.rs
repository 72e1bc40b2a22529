//! SQLite Encumbrance Ledger
//!
//! Reads the `encumbrance_state` and `encumbrance_log` tables on the shared
//! pool. Log rows are versioned record envelopes; rows that fail to decode
//! are quarantined (logged and skipped). Negative availability is reported
//! as stored, never corrected.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;

use super::{apply_event, metal_key, EncumbranceError, EncumbranceLedger, MAX_LOG_ENTRIES};
use crate::storage::{Database, StorageError};
use crate::types::record::{decode_ledger_log, encode_ledger_log};
use crate::types::{unix_now, EncumbranceState, LedgerEvent, LedgerLogEntry};

#[derive(Clone)]
pub struct SqliteEncumbranceLedger {
    db: Database,
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<EncumbranceState> {
    Ok(EncumbranceState {
        metal: row.get("metal")?,
        total_allocated_oz: row.get("total_allocated_oz")?,
        total_encumbered_oz: row.get("total_encumbered_oz")?,
        total_pending_oz: row.get("total_pending_oz")?,
        active_lease_count: row.get::<_, i64>("active_lease_count")?.max(0) as u64,
    })
}

impl SqliteEncumbranceLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn summary_sync(&self) -> Result<BTreeMap<String, EncumbranceState>, StorageError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT metal, total_allocated_oz, total_encumbered_oz, total_pending_oz, active_lease_count
             FROM encumbrance_state ORDER BY metal",
        )?;
        let states = stmt
            .query_map([], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(states.into_iter().map(|s| (s.metal.clone(), s)).collect())
    }

    fn log_sync(&self, limit: usize) -> Result<Vec<LedgerLogEntry>, StorageError> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, record FROM encumbrance_log ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit.min(MAX_LOG_ENTRIES) as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match decode_ledger_log(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    target: "custody::storage",
                    id,
                    error = %e,
                    "Quarantined malformed ledger log entry"
                ),
            }
        }
        Ok(entries)
    }

    fn log_count_sync(&self) -> Result<u64, StorageError> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM encumbrance_log", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn apply_sync(&self, metal: &str, event: LedgerEvent) -> Result<EncumbranceState, EncumbranceError> {
        let metal = metal_key(metal)?;
        let metal = metal.as_str();
        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;

        let current = tx
            .query_row(
                "SELECT metal, total_allocated_oz, total_encumbered_oz, total_pending_oz, active_lease_count
                 FROM encumbrance_state WHERE metal = ?1",
                params![metal],
                row_to_state,
            )
            .optional()
            .map_err(StorageError::from)?
            .unwrap_or_else(|| EncumbranceState::empty(metal));

        let next = apply_event(&current, &event)?;
        let now = unix_now();
        let entry = LedgerLogEntry {
            metal: metal.to_string(),
            event,
            recorded_at: now,
        };
        let record = encode_ledger_log(&entry).map_err(|e| StorageError::InvalidData(e.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO encumbrance_state
                (metal, total_allocated_oz, total_encumbered_oz, total_pending_oz, active_lease_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(metal) DO UPDATE SET
                total_allocated_oz = excluded.total_allocated_oz,
                total_encumbered_oz = excluded.total_encumbered_oz,
                total_pending_oz = excluded.total_pending_oz,
                active_lease_count = excluded.active_lease_count,
                updated_at = excluded.updated_at
            "#,
            params![
                metal,
                next.total_allocated_oz,
                next.total_encumbered_oz,
                next.total_pending_oz,
                next.active_lease_count as i64,
                now as i64
            ],
        )
        .map_err(StorageError::from)?;
        tx.execute(
            "INSERT INTO encumbrance_log (metal, record, recorded_at) VALUES (?1, ?2, ?3)",
            params![metal, record, now as i64],
        )
        .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;

        Ok(next)
    }
}

#[async_trait]
impl EncumbranceLedger for SqliteEncumbranceLedger {
    async fn platform_summary(&self) -> Result<BTreeMap<String, EncumbranceState>, EncumbranceError> {
        Ok(self.summary_sync()?)
    }

    async fn ledger_log(&self, limit: usize) -> Result<Vec<LedgerLogEntry>, EncumbranceError> {
        Ok(self.log_sync(limit)?)
    }

    async fn log_count(&self) -> Result<u64, EncumbranceError> {
        Ok(self.log_count_sync()?)
    }

    async fn apply(&self, metal: &str, event: LedgerEvent) -> Result<EncumbranceState, EncumbranceError> {
        self.apply_sync(metal, event)
    }
}
