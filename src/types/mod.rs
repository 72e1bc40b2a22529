//! Shared Types Module
//!
//! Data types shared across the custody ledger.

pub mod chain;
pub mod checkpoint;
pub mod deposit;
pub mod encumbrance;
pub mod ledger;
pub mod record;
pub mod units;

// Re-exports for convenience
pub use chain::{normalize_address, normalize_tx_hash, Chain, Coin, SymbolError};
pub use checkpoint::{checkpoint_key, ChainScanStatus, Cursor, ResumePoint, ScanCheckpoint};
pub use deposit::{
    dedup_key, ClaimOutcome, CreditedAmounts, DedupRecord, DedupStatus, Deposit, OrphanDeposit,
    PriceSource, RecordError, CLAIM_LEASE_SECS, CREDITED_TTL_SECS, ORPHAN_TTL_SECS,
};
pub use encumbrance::{EncumbranceState, IntegrityViolation, LedgerEvent, LedgerLogEntry};
pub use ledger::{
    BalanceIncrement, BalanceKey, CreditPlan, DailyStats, RecentDeposit, TransactionKind,
    TransactionRecord, UserBalance, RECENT_FEED_LIMIT,
};
pub use record::{LedgerRecord, RecordEnvelope, RECORD_SCHEMA_VERSION};
pub use units::{grams_to_oz, oz_to_grams, unix_now, GRAMS_PER_TROY_OZ};
