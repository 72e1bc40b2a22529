//! Deposit Types
//!
//! An observed on-chain deposit moves through exactly one transition:
//!
//! ```text
//! unseen → duplicate | orphan | credited
//! ```
//!
//! The dedup record keyed by transaction hash is the single source of truth
//! for whether a deposit has already been handled.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::chain::{normalize_address, normalize_tx_hash, Chain, Coin};

/// Credited dedup records live for a year
pub const CREDITED_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Orphan dedup records live for 30 days
pub const ORPHAN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// An in-flight claim older than this may be taken over by another worker
pub const CLAIM_LEASE_SECS: u64 = 10 * 60;

/// Validation failures for deposit-shaped records
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecordError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{coin} is not carried on {chain}")]
    CoinMismatch { chain: Chain, coin: Coin },

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u16),

    #[error("unexpected record kind: expected {expected}, got {got}")]
    UnexpectedKind { expected: &'static str, got: String },

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// A transfer into a custody address, as observed by a chain scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deposit {
    pub chain: Chain,
    pub coin: Coin,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    /// Amount in whole coin units (not base units)
    pub amount: f64,
    /// Unix seconds of the block / ledger that included the transfer
    pub observed_at: u64,
}

impl Deposit {
    pub fn new(
        chain: Chain,
        coin: Coin,
        tx_hash: impl Into<String>,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        amount: f64,
        observed_at: u64,
    ) -> Self {
        Self {
            chain,
            coin,
            tx_hash: tx_hash.into(),
            from_address: from_address.into(),
            to_address: to_address.into(),
            amount,
            observed_at,
        }
    }

    /// Canonical transaction hash used as the dedup identity
    pub fn canonical_tx_hash(&self) -> String {
        normalize_tx_hash(&self.tx_hash)
    }

    /// Canonical sender address used for user resolution
    pub fn canonical_sender(&self) -> String {
        normalize_address(&self.from_address)
    }

    /// Reject structurally invalid deposits before they reach the ledger
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.tx_hash.trim().is_empty() {
            return Err(RecordError::MissingField("tx_hash"));
        }
        if self.from_address.trim().is_empty() {
            return Err(RecordError::MissingField("from_address"));
        }
        if self.to_address.trim().is_empty() {
            return Err(RecordError::MissingField("to_address"));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(RecordError::InvalidAmount(self.amount.to_string()));
        }
        if !self.chain.carries(self.coin) {
            return Err(RecordError::CoinMismatch {
                chain: self.chain,
                coin: self.coin,
            });
        }
        Ok(())
    }
}

/// Storage key of the dedup record for a transaction hash
pub fn dedup_key(tx_hash: &str) -> String {
    format!("deposit:tx:{}", normalize_tx_hash(tx_hash))
}

/// Status of a dedup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    /// Claimed by a worker, commit not yet written
    Processing,
    /// Sender could not be mapped to a user
    Orphan,
    /// Balance credited
    Credited,
}

impl std::fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Processing => "processing",
            Self::Orphan => "orphan",
            Self::Credited => "credited",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DedupStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "orphan" => Ok(Self::Orphan),
            "credited" => Ok(Self::Credited),
            other => Err(RecordError::Malformed(format!("dedup status {}", other))),
        }
    }
}

/// Where the USD price of a credit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Oracle,
    Fallback,
}

/// Amounts applied when a deposit was credited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditedAmounts {
    pub coin: Coin,
    pub native_amount: f64,
    pub price_usd: f64,
    pub price_source: PriceSource,
    pub amount_usd: f64,
    /// Whether the deposit was converted into platform units
    pub converted: bool,
    pub platform_units: f64,
    pub bonus_units: f64,
    pub bonus_pct: f64,
}

/// Persisted marker that a transaction hash has been handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Canonical transaction hash
    pub tx_hash: String,
    pub status: DedupStatus,
    pub resolved_user: Option<String>,
    pub amounts: Option<CreditedAmounts>,
    pub processed_at: u64,
    pub expires_at: u64,
}

impl DedupRecord {
    /// In-flight claim written by the set-if-absent check
    pub fn processing(tx_hash: &str, now: u64) -> Self {
        Self {
            tx_hash: normalize_tx_hash(tx_hash),
            status: DedupStatus::Processing,
            resolved_user: None,
            amounts: None,
            processed_at: now,
            expires_at: now + CLAIM_LEASE_SECS,
        }
    }

    pub fn orphan(tx_hash: &str, now: u64) -> Self {
        Self {
            tx_hash: normalize_tx_hash(tx_hash),
            status: DedupStatus::Orphan,
            resolved_user: None,
            amounts: None,
            processed_at: now,
            expires_at: now + ORPHAN_TTL_SECS,
        }
    }

    pub fn credited(tx_hash: &str, user_id: &str, amounts: CreditedAmounts, now: u64) -> Self {
        Self {
            tx_hash: normalize_tx_hash(tx_hash),
            status: DedupStatus::Credited,
            resolved_user: Some(user_id.to_string()),
            amounts: Some(amounts),
            processed_at: now,
            expires_at: now + CREDITED_TTL_SECS,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Whether a new worker may take this record over
    ///
    /// Expired records of any status are gone; a processing claim is only
    /// reclaimable once its lease has run out.
    pub fn is_reclaimable(&self, now: u64) -> bool {
        self.is_expired(now)
            || (self.status == DedupStatus::Processing
                && self.processed_at + CLAIM_LEASE_SECS <= now)
    }
}

/// Result of the atomic set-if-absent claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the transaction hash
    Claimed,
    /// Another record already exists
    Existing(DedupRecord),
}

/// A deposit whose sender could not be resolved to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrphanDeposit {
    pub deposit: Deposit,
    pub reason: String,
    pub queued_at: u64,
}

impl OrphanDeposit {
    pub fn new(deposit: Deposit, reason: impl Into<String>, queued_at: u64) -> Self {
        Self {
            deposit,
            reason: reason.into(),
            queued_at,
        }
    }

    pub fn tx_hash(&self) -> String {
        self.deposit.canonical_tx_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Deposit {
        Deposit::new(
            Chain::Eth,
            Coin::Eth,
            "0xABC123",
            "0xSender",
            "0xCustody",
            0.5,
            1_700_000_000,
        )
    }

    #[test]
    fn test_dedup_key_scheme() {
        assert_eq!(dedup_key("0xABC123"), "deposit:tx:0xabc123");
        assert_eq!(dedup_key(&sample().tx_hash), dedup_key("0xabc123"));
    }

    #[test]
    fn test_validate_rejects_bad_amounts() {
        let mut deposit = sample();
        assert!(deposit.validate().is_ok());

        deposit.amount = 0.0;
        assert!(matches!(deposit.validate(), Err(RecordError::InvalidAmount(_))));

        deposit.amount = f64::NAN;
        assert!(deposit.validate().is_err());

        let mut deposit = sample();
        deposit.tx_hash = "  ".to_string();
        assert_eq!(deposit.validate(), Err(RecordError::MissingField("tx_hash")));
    }

    #[test]
    fn test_validate_rejects_foreign_coin() {
        let mut deposit = sample();
        deposit.chain = Chain::Sol;
        assert_eq!(
            deposit.validate(),
            Err(RecordError::CoinMismatch {
                chain: Chain::Sol,
                coin: Coin::Eth
            })
        );
    }

    #[test]
    fn test_claim_lease() {
        let claim = DedupRecord::processing("0xabc", 1_000);
        assert!(!claim.is_reclaimable(1_000 + CLAIM_LEASE_SECS - 1));
        assert!(claim.is_reclaimable(1_000 + CLAIM_LEASE_SECS));

        let orphan = DedupRecord::orphan("0xabc", 1_000);
        assert!(!orphan.is_reclaimable(1_000 + CLAIM_LEASE_SECS));
        assert!(orphan.is_reclaimable(1_000 + ORPHAN_TTL_SECS));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [DedupStatus::Processing, DedupStatus::Orphan, DedupStatus::Credited] {
            assert_eq!(status.to_string().parse::<DedupStatus>().unwrap(), status);
        }
        assert!("duplicate".parse::<DedupStatus>().is_err());
    }
}
