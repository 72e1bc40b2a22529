//! SQLite Persistent Ledger Store
//!
//! Durable storage for balances, dedup records, orphans and scan progress.
//! Conditional writes are expressed in SQL so the check and the write are
//! one statement or one `IMMEDIATE` transaction.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;

use super::database::Database;
use super::traits::{LedgerStore, StorageError, StorageResult};
use crate::types::record::{decode_orphan, encode_orphan};
use crate::types::{
    checkpoint_key, dedup_key, normalize_address, unix_now, ChainScanStatus, Chain, ClaimOutcome,
    CreditPlan, CreditedAmounts, DailyStats, DedupRecord, DedupStatus, OrphanDeposit,
    RecentDeposit, ScanCheckpoint, TransactionKind, TransactionRecord, UserBalance,
    CLAIM_LEASE_SECS, RECENT_FEED_LIMIT,
};

const SCANNER_ENABLED_KEY: &str = "scanner:enabled";

/// SQLite-backed ledger store on the shared pool
#[derive(Clone)]
pub struct SqliteLedgerStore {
    db: Database,
}

impl SqliteLedgerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a store over a fresh in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(Database::in_memory()?))
    }

    fn invalid<E: std::fmt::Display>(e: E) -> StorageError {
        StorageError::InvalidData(e.to_string())
    }

    /// Convert a database row to DedupRecord
    fn row_to_dedup(row: &rusqlite::Row) -> rusqlite::Result<(DedupRecord, Option<String>, String)> {
        let record = DedupRecord {
            tx_hash: row.get("tx_hash")?,
            // Parsed below; rusqlite rows cannot carry our error type
            status: DedupStatus::Processing,
            resolved_user: row.get("resolved_user")?,
            amounts: None,
            processed_at: row.get::<_, i64>("processed_at")? as u64,
            expires_at: row.get::<_, i64>("expires_at")? as u64,
        };
        Ok((record, row.get("amounts_json")?, row.get("status")?))
    }

    fn finish_dedup(
        (mut record, amounts_json, status): (DedupRecord, Option<String>, String),
    ) -> StorageResult<DedupRecord> {
        record.status = status.parse().map_err(Self::invalid)?;
        record.amounts = amounts_json
            .map(|raw| serde_json::from_str::<CreditedAmounts>(&raw))
            .transpose()
            .map_err(Self::invalid)?;
        Ok(record)
    }

    fn load_dedup(conn: &rusqlite::Connection, key: &str) -> StorageResult<Option<DedupRecord>> {
        let raw = conn
            .query_row(
                "SELECT * FROM dedup_records WHERE dedup_key = ?1",
                params![key],
                Self::row_to_dedup,
            )
            .optional()?;
        raw.map(Self::finish_dedup).transpose()
    }

    fn conflict(key: &str, current: Option<&DedupRecord>) -> StorageError {
        match current {
            Some(record) => StorageError::Conflict(format!(
                "{} is {} (stamp {})",
                key, record.status, record.processed_at
            )),
            None => StorageError::Conflict(format!("{} has no claim", key)),
        }
    }

    // Synchronous helper methods for the trait implementations

    fn get_checkpoint_sync(&self, chain: Chain) -> StorageResult<Option<ScanCheckpoint>> {
        let conn = self.db.conn()?;
        Self::load_checkpoint(&conn, chain)
    }

    fn load_checkpoint(
        conn: &rusqlite::Connection,
        chain: Chain,
    ) -> StorageResult<Option<ScanCheckpoint>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT checkpoint_json FROM checkpoints WHERE key = ?1",
                params![checkpoint_key(chain)],
                |row| row.get(0),
            )
            .optional()?;

        match raw.map(|r| serde_json::from_str::<ScanCheckpoint>(&r)) {
            Some(Ok(checkpoint)) if checkpoint.chain == chain => Ok(Some(checkpoint)),
            Some(Ok(_)) | Some(Err(_)) => {
                tracing::warn!(
                    target: "custody::storage",
                    chain = %chain,
                    "Quarantined malformed checkpoint, scanning from safe start"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save_checkpoint_sync(&self, checkpoint: &ScanCheckpoint) -> StorageResult<ScanCheckpoint> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = Self::load_checkpoint(&tx, checkpoint.chain)?;
        let merged = checkpoint.clone().merged_with(previous.as_ref());
        let json = serde_json::to_string(&merged).map_err(Self::invalid)?;

        tx.execute(
            r#"
            INSERT INTO checkpoints (key, chain, checkpoint_json, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                checkpoint_json = excluded.checkpoint_json,
                updated_at = excluded.updated_at
            "#,
            params![
                checkpoint_key(merged.chain),
                merged.chain.as_str(),
                json,
                merged.updated_at as i64
            ],
        )?;
        tx.commit()?;

        Ok(merged)
    }

    fn clear_checkpoints_sync(&self, chain: Option<Chain>) -> StorageResult<u64> {
        let conn = self.db.conn()?;
        let removed = match chain {
            Some(chain) => conn.execute(
                "DELETE FROM checkpoints WHERE key = ?1",
                params![checkpoint_key(chain)],
            )?,
            None => conn.execute("DELETE FROM checkpoints", [])?,
        };
        Ok(removed as u64)
    }

    fn record_scan_status_sync(&self, chain: Chain, status: &ChainScanStatus) -> StorageResult<()> {
        let conn = self.db.conn()?;
        let json = serde_json::to_string(status).map_err(Self::invalid)?;
        conn.execute(
            r#"
            INSERT INTO scan_status (chain, status_json) VALUES (?1, ?2)
            ON CONFLICT(chain) DO UPDATE SET status_json = excluded.status_json
            "#,
            params![chain.as_str(), json],
        )?;
        Ok(())
    }

    fn scan_statuses_sync(&self) -> StorageResult<Vec<(Chain, ChainScanStatus)>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT chain, status_json FROM scan_status ORDER BY chain")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut statuses = Vec::new();
        for (chain, json) in rows {
            match (chain.parse::<Chain>(), serde_json::from_str::<ChainScanStatus>(&json)) {
                (Ok(chain), Ok(status)) => statuses.push((chain, status)),
                _ => tracing::warn!(target: "custody::storage", chain = %chain, "Skipping malformed scan status"),
            }
        }
        Ok(statuses)
    }

    fn claim_sync(&self, tx_hash: &str, now: u64) -> StorageResult<ClaimOutcome> {
        let claim = DedupRecord::processing(tx_hash, now);
        let key = dedup_key(&claim.tx_hash);
        let conn = self.db.conn()?;

        let written = conn.execute(
            r#"
            INSERT INTO dedup_records (
                dedup_key, tx_hash, status, resolved_user, amounts_json, processed_at, expires_at
            ) VALUES (?1, ?2, 'processing', NULL, NULL, ?3, ?4)
            ON CONFLICT(dedup_key) DO UPDATE SET
                status = 'processing',
                resolved_user = NULL,
                amounts_json = NULL,
                processed_at = excluded.processed_at,
                expires_at = excluded.expires_at
            WHERE dedup_records.expires_at <= ?3
               OR (dedup_records.status = 'processing' AND dedup_records.processed_at + ?5 <= ?3)
            "#,
            params![
                key,
                claim.tx_hash,
                now as i64,
                claim.expires_at as i64,
                CLAIM_LEASE_SECS as i64
            ],
        )?;

        if written == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        match Self::load_dedup(&conn, &key)? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(Self::conflict(&key, None)),
        }
    }

    fn get_dedup_sync(&self, tx_hash: &str, now: u64) -> StorageResult<Option<DedupRecord>> {
        let conn = self.db.conn()?;
        Ok(Self::load_dedup(&conn, &dedup_key(tx_hash))?.filter(|r| !r.is_expired(now)))
    }

    fn release_claim_sync(&self, tx_hash: &str, claim_stamp: u64) -> StorageResult<bool> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM dedup_records WHERE dedup_key = ?1 AND status = 'processing' AND processed_at = ?2",
            params![dedup_key(tx_hash), claim_stamp as i64],
        )?;
        Ok(removed > 0)
    }

    fn commit_credit_sync(&self, plan: &CreditPlan) -> StorageResult<()> {
        let key = dedup_key(&plan.dedup.tx_hash);
        let amounts_json =
            serde_json::to_string(&plan.transaction.amounts).map_err(Self::invalid)?;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let swapped = tx.execute(
            r#"
            UPDATE dedup_records SET
                status = 'credited',
                resolved_user = ?2,
                amounts_json = ?3,
                processed_at = ?4,
                expires_at = ?5
            WHERE dedup_key = ?1 AND status = ?6 AND processed_at = ?7
            "#,
            params![
                key,
                plan.user_id,
                amounts_json,
                plan.dedup.processed_at as i64,
                plan.dedup.expires_at as i64,
                plan.expected.to_string(),
                plan.claim_stamp as i64
            ],
        )?;
        if swapped != 1 {
            let current = Self::load_dedup(&tx, &key)?;
            return Err(Self::conflict(&key, current.as_ref()));
        }

        for increment in &plan.increments {
            tx.execute(
                r#"
                INSERT INTO balances (user_id, asset, amount) VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id, asset) DO UPDATE SET amount = amount + excluded.amount
                "#,
                params![plan.user_id, increment.key.as_key(), increment.amount],
            )?;
        }

        let record = &plan.transaction;
        tx.execute(
            r#"
            INSERT INTO transactions (
                id, user_id, kind, chain, tx_hash, from_address, amounts_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.user_id,
                record.kind.to_string(),
                record.chain.as_str(),
                record.tx_hash,
                record.from_address,
                amounts_json,
                record.created_at as i64
            ],
        )?;

        tx.execute(
            "DELETE FROM orphans WHERE tx_hash = ?1",
            params![plan.dedup.tx_hash],
        )?;

        let entry = serde_json::to_string(&plan.recent_entry()).map_err(Self::invalid)?;
        tx.execute(
            "INSERT INTO recent_deposits (entry_json) VALUES (?1)",
            params![entry],
        )?;
        tx.execute(
            r#"
            DELETE FROM recent_deposits WHERE seq NOT IN (
                SELECT seq FROM recent_deposits ORDER BY seq DESC LIMIT ?1
            )
            "#,
            params![RECENT_FEED_LIMIT as i64],
        )?;

        tx.execute(
            r#"
            INSERT INTO daily_stats (date, credited, converted_usd) VALUES (?1, 1, ?2)
            ON CONFLICT(date) DO UPDATE SET
                credited = credited + 1,
                converted_usd = converted_usd + excluded.converted_usd
            "#,
            params![plan.stats_date, plan.converted_usd()],
        )?;
        tx.execute(
            r#"
            INSERT INTO daily_chain_stats (date, chain, count) VALUES (?1, ?2, 1)
            ON CONFLICT(date, chain) DO UPDATE SET count = count + 1
            "#,
            params![plan.stats_date, plan.deposit.chain.as_str()],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn commit_orphan_sync(
        &self,
        orphan: &OrphanDeposit,
        dedup: &DedupRecord,
        claim_stamp: u64,
    ) -> StorageResult<()> {
        let key = dedup_key(&dedup.tx_hash);
        let record = encode_orphan(orphan).map_err(Self::invalid)?;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let swapped = tx.execute(
            r#"
            UPDATE dedup_records SET status = 'orphan', processed_at = ?2, expires_at = ?3
            WHERE dedup_key = ?1 AND status = 'processing' AND processed_at = ?4
            "#,
            params![
                key,
                dedup.processed_at as i64,
                dedup.expires_at as i64,
                claim_stamp as i64
            ],
        )?;
        if swapped != 1 {
            let current = Self::load_dedup(&tx, &key)?;
            return Err(Self::conflict(&key, current.as_ref()));
        }

        tx.execute(
            r#"
            INSERT INTO orphans (tx_hash, record, queued_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(tx_hash) DO UPDATE SET record = excluded.record, queued_at = excluded.queued_at
            "#,
            params![orphan.tx_hash(), record, orphan.queued_at as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn link_address_sync(&self, address: &str, user_id: &str) -> StorageResult<()> {
        if user_id.trim().is_empty() {
            return Err(StorageError::InvalidData("empty user id".to_string()));
        }
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO address_index (address, user_id, linked_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(address) DO UPDATE SET user_id = excluded.user_id, linked_at = excluded.linked_at
            "#,
            params![normalize_address(address), user_id, unix_now() as i64],
        )?;
        Ok(())
    }

    fn resolve_user_sync(&self, address: &str) -> StorageResult<Option<String>> {
        let conn = self.db.conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id FROM address_index WHERE address = ?1",
                params![normalize_address(address)],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_auto_convert_sync(&self, user_id: &str, enabled: bool) -> StorageResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO user_preferences (user_id, auto_convert, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET auto_convert = excluded.auto_convert, updated_at = excluded.updated_at
            "#,
            params![user_id, enabled, unix_now() as i64],
        )?;
        Ok(())
    }

    fn get_auto_convert_sync(&self, user_id: &str) -> StorageResult<Option<bool>> {
        let conn = self.db.conn()?;
        Ok(conn
            .query_row(
                "SELECT auto_convert FROM user_preferences WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn get_balance_sync(&self, user_id: &str) -> StorageResult<UserBalance> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT asset, amount FROM balances WHERE user_id = ?1")?;
        let balances = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(UserBalance {
            user_id: user_id.to_string(),
            balances,
        })
    }

    fn list_transactions_sync(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, kind, chain, tx_hash, from_address, amounts_json, created_at
            FROM transactions WHERE user_id = ?1
            ORDER BY created_at DESC, rowid DESC LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, user_id, kind, chain, tx_hash, from_address, amounts_json, created_at) in rows {
            let kind = match kind.as_str() {
                "deposit_credit" => TransactionKind::DepositCredit,
                "reconciled_credit" => TransactionKind::ReconciledCredit,
                other => return Err(StorageError::InvalidData(format!("transaction kind {}", other))),
            };
            records.push(TransactionRecord {
                id,
                user_id,
                kind,
                chain: chain.parse().map_err(Self::invalid)?,
                tx_hash,
                from_address,
                amounts: serde_json::from_str(&amounts_json).map_err(Self::invalid)?,
                created_at: created_at as u64,
            });
        }
        Ok(records)
    }

    fn get_orphan_sync(&self, tx_hash: &str) -> StorageResult<Option<OrphanDeposit>> {
        let conn = self.db.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT record FROM orphans WHERE tx_hash = ?1",
                params![crate::types::normalize_tx_hash(tx_hash)],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => decode_orphan(&raw).map(Some).map_err(Self::invalid),
            None => Ok(None),
        }
    }

    fn list_orphans_sync(&self, limit: usize) -> StorageResult<Vec<OrphanDeposit>> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare("SELECT tx_hash, record FROM orphans ORDER BY queued_at ASC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut orphans = Vec::with_capacity(rows.len());
        for (tx_hash, raw) in rows {
            match decode_orphan(&raw) {
                Ok(orphan) => orphans.push(orphan),
                Err(e) => tracing::warn!(
                    target: "custody::storage",
                    tx_hash = %tx_hash,
                    error = %e,
                    "Quarantined malformed orphan record"
                ),
            }
        }
        Ok(orphans)
    }

    fn recent_deposits_sync(&self, limit: usize) -> StorageResult<Vec<RecentDeposit>> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare("SELECT entry_json FROM recent_deposits ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit.min(RECENT_FEED_LIMIT) as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .iter()
            .filter_map(|raw| serde_json::from_str::<RecentDeposit>(raw).ok())
            .collect())
    }

    fn daily_stats_sync(&self, days: usize) -> StorageResult<Vec<DailyStats>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, credited, converted_usd FROM daily_stats ORDER BY date DESC LIMIT ?1",
        )?;
        let mut stats = stmt
            .query_map(params![days as i64], |row| {
                Ok(DailyStats {
                    date: row.get(0)?,
                    credited: row.get::<_, i64>(1)? as u64,
                    converted_usd: row.get(2)?,
                    by_chain: BTreeMap::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut chain_stmt =
            conn.prepare("SELECT chain, count FROM daily_chain_stats WHERE date = ?1")?;
        for day in stats.iter_mut() {
            day.by_chain = chain_stmt
                .query_map(params![day.date], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
        }

        Ok(stats)
    }

    fn scanner_enabled_sync(&self) -> StorageResult<bool> {
        let conn = self.db.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SCANNER_ENABLED_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v != "false").unwrap_or(true))
    }

    fn set_scanner_enabled_sync(&self, enabled: bool) -> StorageResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![SCANNER_ENABLED_KEY, enabled.to_string()],
        )?;
        Ok(())
    }

    fn purge_expired_sync(&self, now: u64) -> StorageResult<u64> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM dedup_records WHERE expires_at <= ?1",
            params![now as i64],
        )?;
        Ok(removed as u64)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_checkpoint(&self, chain: Chain) -> StorageResult<Option<ScanCheckpoint>> {
        self.get_checkpoint_sync(chain)
    }

    async fn save_checkpoint(&self, checkpoint: &ScanCheckpoint) -> StorageResult<ScanCheckpoint> {
        self.save_checkpoint_sync(checkpoint)
    }

    async fn clear_checkpoints(&self, chain: Option<Chain>) -> StorageResult<u64> {
        self.clear_checkpoints_sync(chain)
    }

    async fn record_scan_status(&self, chain: Chain, status: &ChainScanStatus) -> StorageResult<()> {
        self.record_scan_status_sync(chain, status)
    }

    async fn scan_statuses(&self) -> StorageResult<Vec<(Chain, ChainScanStatus)>> {
        self.scan_statuses_sync()
    }

    async fn claim(&self, tx_hash: &str, now: u64) -> StorageResult<ClaimOutcome> {
        self.claim_sync(tx_hash, now)
    }

    async fn get_dedup(&self, tx_hash: &str, now: u64) -> StorageResult<Option<DedupRecord>> {
        self.get_dedup_sync(tx_hash, now)
    }

    async fn release_claim(&self, tx_hash: &str, claim_stamp: u64) -> StorageResult<bool> {
        self.release_claim_sync(tx_hash, claim_stamp)
    }

    async fn commit_credit(&self, plan: &CreditPlan) -> StorageResult<()> {
        self.commit_credit_sync(plan)
    }

    async fn commit_orphan(
        &self,
        orphan: &OrphanDeposit,
        dedup: &DedupRecord,
        claim_stamp: u64,
    ) -> StorageResult<()> {
        self.commit_orphan_sync(orphan, dedup, claim_stamp)
    }

    async fn link_address(&self, address: &str, user_id: &str) -> StorageResult<()> {
        self.link_address_sync(address, user_id)
    }

    async fn resolve_user(&self, address: &str) -> StorageResult<Option<String>> {
        self.resolve_user_sync(address)
    }

    async fn set_auto_convert(&self, user_id: &str, enabled: bool) -> StorageResult<()> {
        self.set_auto_convert_sync(user_id, enabled)
    }

    async fn get_auto_convert(&self, user_id: &str) -> StorageResult<Option<bool>> {
        self.get_auto_convert_sync(user_id)
    }

    async fn get_balance(&self, user_id: &str) -> StorageResult<UserBalance> {
        self.get_balance_sync(user_id)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<TransactionRecord>> {
        self.list_transactions_sync(user_id, limit)
    }

    async fn get_orphan(&self, tx_hash: &str) -> StorageResult<Option<OrphanDeposit>> {
        self.get_orphan_sync(tx_hash)
    }

    async fn list_orphans(&self, limit: usize) -> StorageResult<Vec<OrphanDeposit>> {
        self.list_orphans_sync(limit)
    }

    async fn recent_deposits(&self, limit: usize) -> StorageResult<Vec<RecentDeposit>> {
        self.recent_deposits_sync(limit)
    }

    async fn daily_stats(&self, days: usize) -> StorageResult<Vec<DailyStats>> {
        self.daily_stats_sync(days)
    }

    async fn scanner_enabled(&self) -> StorageResult<bool> {
        self.scanner_enabled_sync()
    }

    async fn set_scanner_enabled(&self, enabled: bool) -> StorageResult<()> {
        self.set_scanner_enabled_sync(enabled)
    }

    async fn purge_expired(&self, now: u64) -> StorageResult<u64> {
        self.purge_expired_sync(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BalanceIncrement, BalanceKey, Coin, Cursor, Deposit, PriceSource, TransactionKind,
        CLAIM_LEASE_SECS,
    };

    fn deposit(tx: &str) -> Deposit {
        Deposit::new(Chain::Eth, Coin::Eth, tx, "0xsender", "0xcustody", 0.5, 1_000)
    }

    fn amounts() -> CreditedAmounts {
        CreditedAmounts {
            coin: Coin::Eth,
            native_amount: 0.5,
            price_usd: 3500.0,
            price_source: PriceSource::Oracle,
            amount_usd: 1750.0,
            converted: true,
            platform_units: 1750.0,
            bonus_units: 87.5,
            bonus_pct: 5.0,
        }
    }

    fn plan(tx: &str, expected: DedupStatus, claim_stamp: u64, now: u64) -> CreditPlan {
        let deposit = deposit(tx);
        let transaction = TransactionRecord::new(
            "user-1",
            TransactionKind::DepositCredit,
            &deposit,
            amounts(),
            now,
        );
        CreditPlan {
            dedup: DedupRecord::credited(tx, "user-1", amounts(), now),
            deposit,
            user_id: "user-1".to_string(),
            increments: vec![
                BalanceIncrement { key: BalanceKey::PlatformUnit, amount: 1750.0 },
                BalanceIncrement { key: BalanceKey::Bonus, amount: 87.5 },
            ],
            transaction,
            expected,
            claim_stamp,
            stats_date: "2026-01-01".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_then_credit() {
        let store = SqliteLedgerStore::in_memory().unwrap();

        assert_eq!(store.claim("0xAA", 100).await.unwrap(), ClaimOutcome::Claimed);
        store
            .commit_credit(&plan("0xaa", DedupStatus::Processing, 100, 101))
            .await
            .unwrap();

        let record = store.get_dedup("0xaa", 102).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Credited);
        assert_eq!(record.amounts.unwrap().bonus_units, 87.5);

        let balance = store.get_balance("user-1").await.unwrap();
        assert_eq!(balance.platform_units(), 1750.0);
        assert_eq!(balance.bonus_units(), 87.5);

        let txs = store.list_transactions("user-1", 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].chain, Chain::Eth);

        let stats = store.daily_stats(7).await.unwrap();
        assert_eq!(stats[0].credited, 1);
        assert_eq!(stats[0].converted_usd, 1750.0);
        assert_eq!(stats[0].by_chain.get("ETH"), Some(&1));
    }

    #[tokio::test]
    async fn test_existing_record_blocks_claim() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.claim("0xbb", 100).await.unwrap();
        store
            .commit_credit(&plan("0xbb", DedupStatus::Processing, 100, 100))
            .await
            .unwrap();

        match store.claim("0xBB", 200).await.unwrap() {
            ClaimOutcome::Existing(record) => assert_eq!(record.status, DedupStatus::Credited),
            other => panic!("expected existing record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimable() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.claim("0xcc", 100).await.unwrap();

        assert!(matches!(
            store.claim("0xcc", 100 + CLAIM_LEASE_SECS - 1).await.unwrap(),
            ClaimOutcome::Existing(_)
        ));
        assert_eq!(
            store.claim("0xcc", 100 + CLAIM_LEASE_SECS).await.unwrap(),
            ClaimOutcome::Claimed
        );

        // The original owner lost the claim and cannot commit anymore
        let result = store
            .commit_credit(&plan("0xcc", DedupStatus::Processing, 100, 100 + CLAIM_LEASE_SECS))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert_eq!(store.get_balance("user-1").await.unwrap().platform_units(), 0.0);
    }

    #[tokio::test]
    async fn test_orphan_commit_and_reconcile() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.claim("0xdd", 100).await.unwrap();

        let orphan = OrphanDeposit::new(deposit("0xdd"), "sender not mapped", 100);
        store
            .commit_orphan(&orphan, &DedupRecord::orphan("0xdd", 100), 100)
            .await
            .unwrap();
        assert_eq!(store.list_orphans(10).await.unwrap(), vec![orphan.clone()]);
        assert_eq!(store.get_orphan("0xDD").await.unwrap(), Some(orphan));

        store
            .commit_credit(&plan("0xdd", DedupStatus::Orphan, 100, 150))
            .await
            .unwrap();
        assert!(store.list_orphans(10).await.unwrap().is_empty());

        // A second reconcile expecting the orphan state is refused
        let again = store
            .commit_credit(&plan("0xdd", DedupStatus::Orphan, 100, 160))
            .await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_malformed_orphan_is_quarantined() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        {
            let conn = store.db.conn().unwrap();
            conn.execute(
                "INSERT INTO orphans (tx_hash, record, queued_at) VALUES ('0xee', '{\"garbage\":true}', 1)",
                [],
            )
            .unwrap();
        }

        assert!(store.list_orphans(10).await.unwrap().is_empty());
        assert!(matches!(
            store.get_orphan("0xee").await,
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_feed_is_bounded() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        for i in 0..(RECENT_FEED_LIMIT + 5) {
            let tx = format!("0x{:04x}", i);
            store.claim(&tx, 100).await.unwrap();
            store
                .commit_credit(&plan(&tx, DedupStatus::Processing, 100, 100))
                .await
                .unwrap();
        }

        let recent = store.recent_deposits(500).await.unwrap();
        assert_eq!(recent.len(), RECENT_FEED_LIMIT);
        assert_eq!(recent[0].tx_hash, format!("0x{:04x}", RECENT_FEED_LIMIT + 4));
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.claim("0xf1", 100).await.unwrap();
        store
            .commit_orphan(
                &OrphanDeposit::new(deposit("0xf1"), "unmapped", 100),
                &DedupRecord::orphan("0xf1", 100),
                100,
            )
            .await
            .unwrap();

        assert_eq!(store.purge_expired(200).await.unwrap(), 0);
        assert_eq!(
            store.purge_expired(100 + crate::types::ORPHAN_TTL_SECS).await.unwrap(),
            1
        );
        // The queue entry survives until reconciled
        assert_eq!(store.list_orphans(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_persistence() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store
            .save_checkpoint(&ScanCheckpoint::new(Chain::Xrp, Cursor::LedgerIndex(80), 1))
            .await
            .unwrap();
        let stored = store
            .save_checkpoint(&ScanCheckpoint::new(Chain::Xrp, Cursor::LedgerIndex(70), 2))
            .await
            .unwrap();
        assert_eq!(stored.cursor, Cursor::LedgerIndex(80));
        assert_eq!(
            store.get_checkpoint(Chain::Xrp).await.unwrap().unwrap().cursor,
            Cursor::LedgerIndex(80)
        );

        assert_eq!(store.clear_checkpoints(Some(Chain::Xrp)).await.unwrap(), 1);
        assert!(store.get_checkpoint(Chain::Xrp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preferences_and_index() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        assert_eq!(store.get_auto_convert("u").await.unwrap(), None);
        store.set_auto_convert("u", false).await.unwrap();
        assert_eq!(store.get_auto_convert("u").await.unwrap(), Some(false));

        store.link_address("0xABCD", "u").await.unwrap();
        assert_eq!(store.resolve_user("0xabcd").await.unwrap(), Some("u".to_string()));
        assert!(store.scanner_enabled().await.unwrap());
    }
}
