//! Deposit Processor
//!
//! The single ingestion interface for scanned deposits, webhook deposits and
//! operator reconciliation. Every path claims the transaction hash with a
//! conditional write before anything else and commits the outcome with a
//! compare-and-set against that claim.
//!
//! ```text
//! claim ─┬─ existing record ───────────────→ duplicate
//!        ├─ sender unmapped ─ commit_orphan → orphan
//!        └─ sender mapped ── commit_credit ─→ credited
//! ```

pub mod bonus;

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::common::logging::log_deposit_event;
use crate::pricing::PriceBook;
use crate::storage::{LedgerStore, StorageError};
use crate::types::{
    normalize_tx_hash, unix_now, BalanceIncrement, BalanceKey, ClaimOutcome,
    CreditPlan, CreditedAmounts, DedupRecord, DedupStatus, Deposit, OrphanDeposit,
    TransactionKind, TransactionRecord,
};

pub use bonus::{BonusError, BonusSchedule, BonusTier};

/// Reason stored with deposits whose sender has no linked user
pub const ORPHAN_REASON_UNMAPPED: &str = "sender address not linked to a user";

/// Deposit processing errors
///
/// Duplicates and orphans are outcomes, not errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("transaction {0} is already credited")]
    AlreadyCredited(String),

    #[error("transaction {0} is being processed by another worker")]
    InProgress(String),

    #[error("no orphan deposit for transaction {0}")]
    OrphanNotFound(String),

    #[error("invalid deposit: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ProcessError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ProcessError::AlreadyCredited(_) => "ALREADY_CREDITED",
            ProcessError::InProgress(_) => "IN_PROGRESS",
            ProcessError::OrphanNotFound(_) => "ORPHAN_NOT_FOUND",
            ProcessError::Invalid(_) => "INVALID_DEPOSIT",
            ProcessError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::InProgress(_) => true,
            ProcessError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Terminal outcome of processing one deposit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Duplicate {
        tx_hash: String,
        status: DedupStatus,
    },
    Orphan {
        tx_hash: String,
    },
    Credited {
        tx_hash: String,
        user_id: String,
        amounts: CreditedAmounts,
    },
}

impl ProcessOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessOutcome::Duplicate { .. } => "duplicate",
            ProcessOutcome::Orphan { .. } => "orphan",
            ProcessOutcome::Credited { .. } => "credited",
        }
    }
}

/// UTC date bucket of a Unix timestamp
fn stats_date(now: u64) -> String {
    chrono::DateTime::from_timestamp(now as i64, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Idempotent deposit state machine
#[derive(Clone)]
pub struct DepositProcessor {
    store: Arc<dyn LedgerStore>,
    prices: PriceBook,
    bonus: BonusSchedule,
}

impl DepositProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, prices: PriceBook, bonus: BonusSchedule) -> Self {
        Self {
            store,
            prices,
            bonus,
        }
    }

    /// Process one observed deposit exactly once
    pub async fn process(
        &self,
        deposit: &Deposit,
        correlation_id: Option<&str>,
    ) -> Result<ProcessOutcome, ProcessError> {
        deposit
            .validate()
            .map_err(|e| ProcessError::Invalid(e.to_string()))?;

        let tx_hash = deposit.canonical_tx_hash();
        let chain = deposit.chain.as_str();
        let now = unix_now();

        if let ClaimOutcome::Existing(record) = self.store.claim(&tx_hash, now).await? {
            log_deposit_event("duplicate", chain, &tx_hash, deposit.amount, correlation_id, None);
            return Ok(ProcessOutcome::Duplicate {
                tx_hash,
                status: record.status,
            });
        }

        let result = self.settle_claimed(deposit, &tx_hash, now).await;
        match &result {
            Ok(outcome) => {
                log_deposit_event(outcome.name(), chain, &tx_hash, deposit.amount, correlation_id, None)
            }
            Err(e) => {
                self.release(&tx_hash, now).await;
                log_deposit_event(
                    "failed",
                    chain,
                    &tx_hash,
                    deposit.amount,
                    correlation_id,
                    Some(&e.to_string()),
                );
            }
        }
        result
    }

    async fn settle_claimed(
        &self,
        deposit: &Deposit,
        tx_hash: &str,
        claim_stamp: u64,
    ) -> Result<ProcessOutcome, ProcessError> {
        let Some(user_id) = self.store.resolve_user(&deposit.canonical_sender()).await? else {
            let orphan = OrphanDeposit::new(deposit.clone(), ORPHAN_REASON_UNMAPPED, claim_stamp);
            let record = DedupRecord::orphan(tx_hash, claim_stamp);
            self.store.commit_orphan(&orphan, &record, claim_stamp).await?;
            return Ok(ProcessOutcome::Orphan {
                tx_hash: tx_hash.to_string(),
            });
        };

        let plan = self
            .plan_credit(
                deposit,
                &user_id,
                TransactionKind::DepositCredit,
                DedupStatus::Processing,
                claim_stamp,
            )
            .await?;
        self.store.commit_credit(&plan).await?;

        Ok(ProcessOutcome::Credited {
            tx_hash: tx_hash.to_string(),
            user_id,
            amounts: plan.transaction.amounts,
        })
    }

    async fn release(&self, tx_hash: &str, claim_stamp: u64) {
        if let Err(e) = self.store.release_claim(tx_hash, claim_stamp).await {
            tracing::error!(tx = %tx_hash, error = %e, "Failed to release deposit claim");
        }
    }

    /// Credit an orphaned deposit to an operator-chosen user
    ///
    /// `user_address` is either an address linked through the address index
    /// or a user id, used verbatim. Rejected when the transaction is already credited, whichever path
    /// credited it.
    pub async fn reconcile_orphan(
        &self,
        tx_hash: &str,
        user_address: &str,
        correlation_id: Option<&str>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let tx_hash = normalize_tx_hash(tx_hash);
        let target = user_address.trim();
        if tx_hash.is_empty() || target.is_empty() {
            return Err(ProcessError::Invalid("tx hash and user address are required".to_string()));
        }
        // A linked address credits its user; anything else is taken as the user id itself
        let user_id = match self.store.resolve_user(target).await? {
            Some(linked) => linked,
            None => target.to_string(),
        };

        let now = unix_now();
        let (expected, claim_stamp, claimed) = match self.store.get_dedup(&tx_hash, now).await? {
            Some(record) if record.status == DedupStatus::Credited => {
                return Err(ProcessError::AlreadyCredited(tx_hash));
            }
            Some(record) if record.status == DedupStatus::Orphan => {
                (DedupStatus::Orphan, record.processed_at, false)
            }
            Some(record) if !record.is_reclaimable(now) => {
                return Err(ProcessError::InProgress(tx_hash));
            }
            _ => match self.store.claim(&tx_hash, now).await? {
                ClaimOutcome::Claimed => (DedupStatus::Processing, now, true),
                ClaimOutcome::Existing(record) if record.status == DedupStatus::Credited => {
                    return Err(ProcessError::AlreadyCredited(tx_hash));
                }
                ClaimOutcome::Existing(_) => return Err(ProcessError::InProgress(tx_hash)),
            },
        };

        let result = self
            .reconcile_claimed(&tx_hash, &user_id, expected, claim_stamp)
            .await;

        if result.is_err() && claimed {
            self.release(&tx_hash, claim_stamp).await;
        }

        let amount = match &result {
            Ok(ProcessOutcome::Credited { amounts, .. }) => amounts.native_amount,
            _ => 0.0,
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        let outcome = if result.is_ok() { "reconciled" } else { "reconcile_rejected" };
        log_deposit_event(outcome, "-", &tx_hash, amount, correlation_id, error.as_deref());

        result
    }

    async fn reconcile_claimed(
        &self,
        tx_hash: &str,
        user_id: &str,
        expected: DedupStatus,
        claim_stamp: u64,
    ) -> Result<ProcessOutcome, ProcessError> {
        let orphan = self
            .store
            .get_orphan(tx_hash)
            .await?
            .ok_or_else(|| ProcessError::OrphanNotFound(tx_hash.to_string()))?;

        let plan = self
            .plan_credit(
                &orphan.deposit,
                user_id,
                TransactionKind::ReconciledCredit,
                expected,
                claim_stamp,
            )
            .await?;

        match self.store.commit_credit(&plan).await {
            Ok(()) => Ok(ProcessOutcome::Credited {
                tx_hash: tx_hash.to_string(),
                user_id: user_id.to_string(),
                amounts: plan.transaction.amounts,
            }),
            // Someone else settled the record between our read and commit
            Err(StorageError::Conflict(_)) => Err(ProcessError::AlreadyCredited(tx_hash.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Price, apply the conversion policy and assemble the atomic commit
    async fn plan_credit(
        &self,
        deposit: &Deposit,
        user_id: &str,
        kind: TransactionKind,
        expected: DedupStatus,
        claim_stamp: u64,
    ) -> Result<CreditPlan, ProcessError> {
        let auto_convert = self.store.get_auto_convert(user_id).await?.unwrap_or(true);
        let quote = self.prices.quote(deposit.coin).await;
        let amount_usd = deposit.amount * quote.price_usd;

        let (amounts, increments) = if auto_convert {
            let (bonus_pct, bonus_units) = self.bonus.bonus_for(amount_usd);
            (
                CreditedAmounts {
                    coin: deposit.coin,
                    native_amount: deposit.amount,
                    price_usd: quote.price_usd,
                    price_source: quote.source,
                    amount_usd,
                    converted: true,
                    platform_units: amount_usd,
                    bonus_units,
                    bonus_pct,
                },
                vec![
                    BalanceIncrement {
                        key: BalanceKey::PlatformUnit,
                        amount: amount_usd,
                    },
                    BalanceIncrement {
                        key: BalanceKey::Bonus,
                        amount: bonus_units,
                    },
                ],
            )
        } else {
            (
                CreditedAmounts {
                    coin: deposit.coin,
                    native_amount: deposit.amount,
                    price_usd: quote.price_usd,
                    price_source: quote.source,
                    amount_usd,
                    converted: false,
                    platform_units: 0.0,
                    bonus_units: 0.0,
                    bonus_pct: 0.0,
                },
                vec![BalanceIncrement {
                    key: BalanceKey::Native(deposit.coin),
                    amount: deposit.amount,
                }],
            )
        };

        let now = unix_now();
        let tx_hash = deposit.canonical_tx_hash();
        Ok(CreditPlan {
            deposit: deposit.clone(),
            user_id: user_id.to_string(),
            increments,
            transaction: TransactionRecord::new(user_id, kind, deposit, amounts.clone(), now),
            dedup: DedupRecord::credited(&tx_hash, user_id, amounts, now),
            expected,
            claim_stamp,
            stats_date: stats_date(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{MockPriceOracle, PriceError};
    use crate::storage::{MemoryLedgerStore, SqliteLedgerStore};
    use crate::types::{Chain, Coin, PriceSource};

    const SENDER: &str = "0x2222222222222222222222222222222222222222";
    const CUSTODY: &str = "0x1111111111111111111111111111111111111111";
    const USER: &str = "user-u";

    fn eth_deposit(hash: &str) -> Deposit {
        Deposit::new(Chain::Eth, Coin::Eth, hash, SENDER, CUSTODY, 0.5, 1_700_000_000)
    }

    fn processor(store: Arc<dyn LedgerStore>) -> DepositProcessor {
        let mut oracle = MockPriceOracle::new();
        oracle.expect_usd_price().returning(|coin| match coin {
            Coin::Eth => Ok(3_500.0),
            other => Err(PriceError::Missing(other)),
        });
        DepositProcessor::new(store, PriceBook::new(Arc::new(oracle)), BonusSchedule::default())
    }

    #[tokio::test]
    async fn test_mapped_deposit_is_credited_with_bonus() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address(SENDER, USER).await.unwrap();
        let processor = processor(store.clone());

        let outcome = processor.process(&eth_deposit("0xA1"), None).await.unwrap();

        match &outcome {
            ProcessOutcome::Credited { user_id, amounts, .. } => {
                assert_eq!(user_id, USER);
                assert_eq!(amounts.amount_usd, 1750.0);
                assert_eq!(amounts.bonus_pct, 5.0);
                assert_eq!(amounts.bonus_units, 87.5);
                assert_eq!(amounts.price_source, PriceSource::Oracle);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let balance = store.get_balance(USER).await.unwrap();
        assert_eq!(balance.platform_units(), 1750.0);
        assert_eq!(balance.bonus_units(), 87.5);

        let history = store.list_transactions(USER, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].chain, Chain::Eth);
        assert_eq!(history[0].kind, TransactionKind::DepositCredit);

        let record = store.get_dedup("0xa1", unix_now()).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Credited);
        assert_eq!(record.resolved_user.as_deref(), Some(USER));
    }

    #[tokio::test]
    async fn test_repeat_deposit_is_duplicate() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address(SENDER, USER).await.unwrap();
        let processor = processor(store.clone());

        processor.process(&eth_deposit("0xA1"), None).await.unwrap();
        let again = processor.process(&eth_deposit("0xa1"), None).await.unwrap();

        assert_eq!(
            again,
            ProcessOutcome::Duplicate {
                tx_hash: "0xa1".to_string(),
                status: DedupStatus::Credited
            }
        );
        let balance = store.get_balance(USER).await.unwrap();
        assert_eq!(balance.platform_units(), 1750.0);
        assert_eq!(store.list_transactions(USER, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_deposit_orphaned_then_reconciled_once() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = processor(store.clone());

        let outcome = processor.process(&eth_deposit("0xB2"), None).await.unwrap();
        assert_eq!(outcome.name(), "orphan");

        let orphans = store.list_orphans(10).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].deposit.chain, Chain::Eth);
        assert_eq!(orphans[0].deposit.coin, Coin::Eth);
        assert_eq!(orphans[0].deposit.amount, 0.5);

        let reconciled = processor.reconcile_orphan("0xB2", USER, None).await.unwrap();
        assert_eq!(reconciled.name(), "credited");
        assert!(store.list_orphans(10).await.unwrap().is_empty());
        assert_eq!(store.get_balance(USER).await.unwrap().platform_units(), 1750.0);

        let history = store.list_transactions(USER, 10).await.unwrap();
        assert_eq!(history[0].kind, TransactionKind::ReconciledCredit);

        let second = processor.reconcile_orphan("0xb2", USER, None).await;
        assert!(matches!(second, Err(ProcessError::AlreadyCredited(_))));
        assert_eq!(store.get_balance(USER).await.unwrap().platform_units(), 1750.0);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_user_id_case() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = processor(store.clone());
        let mixed = "0xAbCdEF0000000000000000000000000000000001";

        processor.process(&eth_deposit("0xC1"), None).await.unwrap();
        store.link_address(SENDER, mixed).await.unwrap();
        processor.process(&eth_deposit("0xC2"), None).await.unwrap();

        match processor.reconcile_orphan("0xC1", mixed, None).await.unwrap() {
            ProcessOutcome::Credited { user_id, .. } => assert_eq!(user_id, mixed),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.get_balance(mixed).await.unwrap().platform_units(), 3_500.0);
        assert_eq!(store.list_transactions(mixed, 10).await.unwrap().len(), 2);
        assert_eq!(
            store.get_balance(&mixed.to_lowercase()).await.unwrap().platform_units(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_reconcile_to_linked_address_credits_its_user() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = processor(store.clone());

        processor.process(&eth_deposit("0xC3"), None).await.unwrap();
        store
            .link_address("0x3333333333333333333333333333333333333333", USER)
            .await
            .unwrap();

        let outcome = processor
            .reconcile_orphan("0xC3", "0x3333333333333333333333333333333333333333", None)
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Credited { ref user_id, .. } if user_id == USER));
        assert_eq!(store.get_balance(USER).await.unwrap().platform_units(), 1750.0);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_pipeline_credited_tx() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address(SENDER, USER).await.unwrap();
        let processor = processor(store.clone());

        processor.process(&eth_deposit("0xC3"), None).await.unwrap();
        let result = processor.reconcile_orphan("0xC3", "someone-else", None).await;

        assert!(matches!(result, Err(ProcessError::AlreadyCredited(_))));
        assert_eq!(store.get_balance("someone-else").await.unwrap().platform_units(), 0.0);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_tx_is_not_found_and_leaves_no_claim() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = processor(store.clone());

        let result = processor.reconcile_orphan("0xdead", USER, None).await;
        assert!(matches!(result, Err(ProcessError::OrphanNotFound(_))));
        assert!(store.get_dedup("0xdead", unix_now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_convert_off_credits_native() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address(SENDER, USER).await.unwrap();
        store.set_auto_convert(USER, false).await.unwrap();
        let processor = processor(store.clone());

        processor.process(&eth_deposit("0xD4"), None).await.unwrap();

        let balance = store.get_balance(USER).await.unwrap();
        assert_eq!(balance.native(Coin::Eth), 0.5);
        assert_eq!(balance.platform_units(), 0.0);
        assert_eq!(balance.bonus_units(), 0.0);
    }

    #[tokio::test]
    async fn test_oracle_failure_uses_fallback() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address("rSender", USER).await.unwrap();
        let processor = processor(store.clone());

        let deposit = Deposit::new(Chain::Xrp, Coin::Xrp, "ABC", "rSender", "rCustody", 100.0, 1);
        let outcome = processor.process(&deposit, None).await.unwrap();

        match outcome {
            ProcessOutcome::Credited { amounts, .. } => {
                assert_eq!(amounts.price_source, PriceSource::Fallback);
                assert!((amounts.amount_usd - 220.0).abs() < 1e-9);
                assert_eq!(amounts.bonus_pct, 3.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_processing_credits_once() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address(SENDER, USER).await.unwrap();
        let processor = processor(store.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                processor.process(&eth_deposit("0xE5"), None).await
            }));
        }

        let mut credited = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().name() == "credited" {
                credited += 1;
            }
        }
        assert_eq!(credited, 1);
        assert_eq!(store.get_balance(USER).await.unwrap().platform_units(), 1750.0);
    }

    #[tokio::test]
    async fn test_invalid_deposit_rejected_before_claim() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = processor(store.clone());

        let mut deposit = eth_deposit("0xF6");
        deposit.amount = 0.0;
        let result = processor.process(&deposit, None).await;

        assert!(matches!(result, Err(ProcessError::Invalid(_))));
        assert!(store.get_dedup("0xf6", unix_now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_full_flow() {
        let store = Arc::new(SqliteLedgerStore::in_memory().unwrap());
        let processor = processor(store.clone());

        assert_eq!(processor.process(&eth_deposit("0x77"), None).await.unwrap().name(), "orphan");
        assert_eq!(processor.process(&eth_deposit("0x77"), None).await.unwrap().name(), "duplicate");

        processor.reconcile_orphan("0x77", USER, None).await.unwrap();
        let balance = store.get_balance(USER).await.unwrap();
        assert_eq!(balance.platform_units(), 1750.0);
        assert_eq!(balance.bonus_units(), 87.5);

        assert!(matches!(
            processor.reconcile_orphan("0x77", USER, None).await,
            Err(ProcessError::AlreadyCredited(_))
        ));
    }
}
