//! Storage Trait Definitions
//!
//! Defines the ledger store interface shared by every ingestion path.
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    ChainScanStatus, Chain, ClaimOutcome, CreditPlan, DailyStats, DedupRecord, OrphanDeposit,
    RecentDeposit, ScanCheckpoint, TransactionRecord, UserBalance,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// A conditional write found a different record state than expected
    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Database(_) | StorageError::Connection(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Ledger storage interface
///
/// Implementations:
/// - `SqliteLedgerStore` - Production storage with SQLite
/// - `MemoryLedgerStore` - In-memory storage for testing
///
/// Every mutation of the dedup key space is a conditional write: `claim`
/// is set-if-absent, and both commits compare the stored status and claim
/// stamp before applying anything.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    async fn get_checkpoint(&self, chain: Chain) -> StorageResult<Option<ScanCheckpoint>>;

    /// Persist a checkpoint, never moving a numeric cursor backwards.
    /// Returns the checkpoint as stored.
    async fn save_checkpoint(&self, checkpoint: &ScanCheckpoint) -> StorageResult<ScanCheckpoint>;

    /// Clear one chain's checkpoint, or all of them. Returns how many were removed.
    async fn clear_checkpoints(&self, chain: Option<Chain>) -> StorageResult<u64>;

    async fn record_scan_status(&self, chain: Chain, status: &ChainScanStatus) -> StorageResult<()>;

    async fn scan_statuses(&self) -> StorageResult<Vec<(Chain, ChainScanStatus)>>;

    // ------------------------------------------------------------------
    // Dedup
    // ------------------------------------------------------------------

    /// Atomically claim a transaction hash.
    ///
    /// Succeeds when no live record exists, or the existing record is a
    /// processing claim whose lease has run out.
    async fn claim(&self, tx_hash: &str, now: u64) -> StorageResult<ClaimOutcome>;

    /// Live (unexpired) dedup record of a transaction hash
    async fn get_dedup(&self, tx_hash: &str, now: u64) -> StorageResult<Option<DedupRecord>>;

    /// Drop a processing claim after a failed commit
    async fn release_claim(&self, tx_hash: &str, claim_stamp: u64) -> StorageResult<bool>;

    /// Apply a credit in one transaction: dedup compare-and-set, balance
    /// increments, transaction record, orphan removal, recent feed, daily stats.
    async fn commit_credit(&self, plan: &CreditPlan) -> StorageResult<()>;

    /// Turn a processing claim into an orphan record and queue the deposit
    async fn commit_orphan(
        &self,
        orphan: &OrphanDeposit,
        dedup: &DedupRecord,
        claim_stamp: u64,
    ) -> StorageResult<()>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Map an on-chain sender address to a platform user
    async fn link_address(&self, address: &str, user_id: &str) -> StorageResult<()>;

    async fn resolve_user(&self, address: &str) -> StorageResult<Option<String>>;

    async fn set_auto_convert(&self, user_id: &str, enabled: bool) -> StorageResult<()>;

    /// Stored auto-convert preference; `None` when the user never set one
    async fn get_auto_convert(&self, user_id: &str) -> StorageResult<Option<bool>>;

    async fn get_balance(&self, user_id: &str) -> StorageResult<UserBalance>;

    /// Newest first
    async fn list_transactions(&self, user_id: &str, limit: usize)
        -> StorageResult<Vec<TransactionRecord>>;

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    async fn get_orphan(&self, tx_hash: &str) -> StorageResult<Option<OrphanDeposit>>;

    /// Oldest first; malformed stored rows are skipped
    async fn list_orphans(&self, limit: usize) -> StorageResult<Vec<OrphanDeposit>>;

    /// Newest first, at most `RECENT_FEED_LIMIT`
    async fn recent_deposits(&self, limit: usize) -> StorageResult<Vec<RecentDeposit>>;

    /// Newest day first
    async fn daily_stats(&self, days: usize) -> StorageResult<Vec<DailyStats>>;

    /// Scanner enable flag, `true` when never set
    async fn scanner_enabled(&self) -> StorageResult<bool>;

    async fn set_scanner_enabled(&self, enabled: bool) -> StorageResult<()>;

    /// Delete expired dedup records. Orphan queue entries stay until reconciled.
    /// Returns rows removed.
    async fn purge_expired(&self, now: u64) -> StorageResult<u64>;
}
