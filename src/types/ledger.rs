//! Ledger Types
//!
//! Balances, transaction history, and the credit plan the deposit processor
//! hands to storage for one atomic commit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain::{Chain, Coin};
use super::deposit::{CreditedAmounts, DedupRecord, DedupStatus, Deposit};

/// Maximum entries kept in the recent-activity feed
pub const RECENT_FEED_LIMIT: usize = 100;

/// Balance key for platform units
pub const PLATFORM_UNIT_KEY: &str = "PLATFORM";

/// Balance key for the bonus sub-balance
pub const BONUS_UNIT_KEY: &str = "PLATFORM_BONUS";

/// Which balance an increment applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "coin")]
pub enum BalanceKey {
    Native(Coin),
    PlatformUnit,
    Bonus,
}

impl BalanceKey {
    /// Storage column value for this balance
    pub fn as_key(&self) -> &'static str {
        match self {
            BalanceKey::Native(coin) => coin.as_str(),
            BalanceKey::PlatformUnit => PLATFORM_UNIT_KEY,
            BalanceKey::Bonus => BONUS_UNIT_KEY,
        }
    }
}

/// One atomic numeric increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceIncrement {
    pub key: BalanceKey,
    pub amount: f64,
}

/// All balances held by one user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub balances: BTreeMap<String, f64>,
}

impl UserBalance {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balances: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: BalanceKey) -> f64 {
        self.balances.get(key.as_key()).copied().unwrap_or(0.0)
    }

    pub fn platform_units(&self) -> f64 {
        self.get(BalanceKey::PlatformUnit)
    }

    pub fn bonus_units(&self) -> f64 {
        self.get(BalanceKey::Bonus)
    }

    pub fn native(&self, coin: Coin) -> f64 {
        self.get(BalanceKey::Native(coin))
    }
}

/// How a transaction record came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credited by the scan pipeline or webhook
    DepositCredit,
    /// Credited by an operator resolving an orphan
    ReconciledCredit,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DepositCredit => write!(f, "deposit_credit"),
            Self::ReconciledCredit => write!(f, "reconciled_credit"),
        }
    }
}

/// Append-only history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionRecord {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub chain: Chain,
    pub tx_hash: String,
    pub from_address: String,
    pub amounts: CreditedAmounts,
    pub created_at: u64,
}

impl TransactionRecord {
    pub fn new(
        user_id: &str,
        kind: TransactionKind,
        deposit: &Deposit,
        amounts: CreditedAmounts,
        created_at: u64,
    ) -> Self {
        Self {
            id: format!("txr_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            kind,
            chain: deposit.chain,
            tx_hash: deposit.canonical_tx_hash(),
            from_address: deposit.from_address.clone(),
            amounts,
            created_at,
        }
    }
}

/// Entry of the bounded recent-activity feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentDeposit {
    pub tx_hash: String,
    pub chain: Chain,
    pub coin: Coin,
    pub amount: f64,
    pub user_id: String,
    pub amount_usd: f64,
    pub platform_units: f64,
    pub bonus_units: f64,
    pub converted: bool,
    pub credited_at: u64,
}

/// Per-day counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    /// `YYYY-MM-DD` in UTC
    pub date: String,
    pub credited: u64,
    pub converted_usd: f64,
    pub by_chain: BTreeMap<String, u64>,
}

/// Everything storage must apply in one transaction to credit a deposit
#[derive(Debug, Clone)]
pub struct CreditPlan {
    pub deposit: Deposit,
    pub user_id: String,
    pub increments: Vec<BalanceIncrement>,
    pub transaction: TransactionRecord,
    /// Final dedup record (status `credited`)
    pub dedup: DedupRecord,
    /// Status the existing dedup record must have for the commit to apply
    pub expected: DedupStatus,
    /// `processed_at` of the record this plan was built against
    pub claim_stamp: u64,
    /// UTC date bucket for daily stats
    pub stats_date: String,
}

impl CreditPlan {
    pub fn recent_entry(&self) -> RecentDeposit {
        let amounts = &self.transaction.amounts;
        RecentDeposit {
            tx_hash: self.dedup.tx_hash.clone(),
            chain: self.deposit.chain,
            coin: self.deposit.coin,
            amount: self.deposit.amount,
            user_id: self.user_id.clone(),
            amount_usd: amounts.amount_usd,
            platform_units: amounts.platform_units,
            bonus_units: amounts.bonus_units,
            converted: amounts.converted,
            credited_at: self.dedup.processed_at,
        }
    }

    /// USD added to the daily converted total
    pub fn converted_usd(&self) -> f64 {
        let amounts = &self.transaction.amounts;
        if amounts.converted {
            amounts.amount_usd
        } else {
            0.0
        }
    }
}
