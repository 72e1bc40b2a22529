//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{LedgerStore, StorageError, StorageResult};
use crate::types::{
    normalize_address, normalize_tx_hash, ChainScanStatus, Chain, ClaimOutcome, CreditPlan,
    DailyStats, DedupRecord, OrphanDeposit, RecentDeposit, ScanCheckpoint, TransactionRecord,
    UserBalance, RECENT_FEED_LIMIT,
};

#[derive(Default)]
struct MemoryState {
    checkpoints: HashMap<Chain, ScanCheckpoint>,
    scan_status: BTreeMap<Chain, ChainScanStatus>,
    dedup: HashMap<String, DedupRecord>,
    address_index: HashMap<String, String>,
    auto_convert: HashMap<String, bool>,
    balances: HashMap<String, UserBalance>,
    transactions: Vec<TransactionRecord>,
    /// Insertion order doubles as queue order
    orphans: Vec<OrphanDeposit>,
    recent: VecDeque<RecentDeposit>,
    daily: BTreeMap<String, DailyStats>,
    scanner_enabled: Option<bool>,
}

/// In-memory ledger store
///
/// One lock guards the whole state so every commit is all-or-nothing.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLedgerStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_claim(
    dedup: &HashMap<String, DedupRecord>,
    key: &str,
    expected: crate::types::DedupStatus,
    claim_stamp: u64,
) -> StorageResult<()> {
    match dedup.get(key) {
        Some(record) if record.status == expected && record.processed_at == claim_stamp => Ok(()),
        Some(record) => Err(StorageError::Conflict(format!(
            "{} is {} (stamp {})",
            key, record.status, record.processed_at
        ))),
        None => Err(StorageError::Conflict(format!("{} has no claim", key))),
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_checkpoint(&self, chain: Chain) -> StorageResult<Option<ScanCheckpoint>> {
        Ok(self.state.read().await.checkpoints.get(&chain).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &ScanCheckpoint) -> StorageResult<ScanCheckpoint> {
        let mut state = self.state.write().await;
        let merged = checkpoint
            .clone()
            .merged_with(state.checkpoints.get(&checkpoint.chain));
        state.checkpoints.insert(checkpoint.chain, merged.clone());
        Ok(merged)
    }

    async fn clear_checkpoints(&self, chain: Option<Chain>) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        match chain {
            Some(chain) => Ok(state.checkpoints.remove(&chain).map(|_| 1).unwrap_or(0)),
            None => {
                let count = state.checkpoints.len() as u64;
                state.checkpoints.clear();
                Ok(count)
            }
        }
    }

    async fn record_scan_status(&self, chain: Chain, status: &ChainScanStatus) -> StorageResult<()> {
        self.state.write().await.scan_status.insert(chain, status.clone());
        Ok(())
    }

    async fn scan_statuses(&self) -> StorageResult<Vec<(Chain, ChainScanStatus)>> {
        let state = self.state.read().await;
        Ok(state
            .scan_status
            .iter()
            .map(|(chain, status)| (*chain, status.clone()))
            .collect())
    }

    async fn claim(&self, tx_hash: &str, now: u64) -> StorageResult<ClaimOutcome> {
        let key = normalize_tx_hash(tx_hash);
        let mut state = self.state.write().await;

        if let Some(existing) = state.dedup.get(&key) {
            if !existing.is_reclaimable(now) {
                return Ok(ClaimOutcome::Existing(existing.clone()));
            }
        }

        state.dedup.insert(key.clone(), DedupRecord::processing(&key, now));
        Ok(ClaimOutcome::Claimed)
    }

    async fn get_dedup(&self, tx_hash: &str, now: u64) -> StorageResult<Option<DedupRecord>> {
        let key = normalize_tx_hash(tx_hash);
        Ok(self
            .state
            .read()
            .await
            .dedup
            .get(&key)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn release_claim(&self, tx_hash: &str, claim_stamp: u64) -> StorageResult<bool> {
        let key = normalize_tx_hash(tx_hash);
        let mut state = self.state.write().await;
        let owned = state.dedup.get(&key).map(|r| {
            r.status == crate::types::DedupStatus::Processing && r.processed_at == claim_stamp
        });
        if owned == Some(true) {
            state.dedup.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn commit_credit(&self, plan: &CreditPlan) -> StorageResult<()> {
        let key = plan.dedup.tx_hash.clone();
        let mut state = self.state.write().await;

        check_claim(&state.dedup, &key, plan.expected, plan.claim_stamp)?;

        state.dedup.insert(key.clone(), plan.dedup.clone());

        let balance = state
            .balances
            .entry(plan.user_id.clone())
            .or_insert_with(|| UserBalance::new(plan.user_id.clone()));
        for increment in &plan.increments {
            *balance
                .balances
                .entry(increment.key.as_key().to_string())
                .or_insert(0.0) += increment.amount;
        }

        state.transactions.push(plan.transaction.clone());
        state.orphans.retain(|o| o.tx_hash() != key);

        state.recent.push_front(plan.recent_entry());
        state.recent.truncate(RECENT_FEED_LIMIT);

        let day = state
            .daily
            .entry(plan.stats_date.clone())
            .or_insert_with(|| DailyStats {
                date: plan.stats_date.clone(),
                ..DailyStats::default()
            });
        day.credited += 1;
        day.converted_usd += plan.converted_usd();
        *day
            .by_chain
            .entry(plan.deposit.chain.as_str().to_string())
            .or_insert(0) += 1;

        Ok(())
    }

    async fn commit_orphan(
        &self,
        orphan: &OrphanDeposit,
        dedup: &DedupRecord,
        claim_stamp: u64,
    ) -> StorageResult<()> {
        let key = dedup.tx_hash.clone();
        let mut state = self.state.write().await;

        check_claim(
            &state.dedup,
            &key,
            crate::types::DedupStatus::Processing,
            claim_stamp,
        )?;

        state.dedup.insert(key.clone(), dedup.clone());
        state.orphans.retain(|o| o.tx_hash() != key);
        state.orphans.push(orphan.clone());
        Ok(())
    }

    async fn link_address(&self, address: &str, user_id: &str) -> StorageResult<()> {
        if user_id.trim().is_empty() {
            return Err(StorageError::InvalidData("empty user id".to_string()));
        }
        self.state
            .write()
            .await
            .address_index
            .insert(normalize_address(address), user_id.to_string());
        Ok(())
    }

    async fn resolve_user(&self, address: &str) -> StorageResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .address_index
            .get(&normalize_address(address))
            .cloned())
    }

    async fn set_auto_convert(&self, user_id: &str, enabled: bool) -> StorageResult<()> {
        self.state
            .write()
            .await
            .auto_convert
            .insert(user_id.to_string(), enabled);
        Ok(())
    }

    async fn get_auto_convert(&self, user_id: &str) -> StorageResult<Option<bool>> {
        Ok(self.state.read().await.auto_convert.get(user_id).copied())
    }

    async fn get_balance(&self, user_id: &str) -> StorageResult<UserBalance> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserBalance::new(user_id)))
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_orphan(&self, tx_hash: &str) -> StorageResult<Option<OrphanDeposit>> {
        let key = normalize_tx_hash(tx_hash);
        Ok(self
            .state
            .read()
            .await
            .orphans
            .iter()
            .find(|o| o.tx_hash() == key)
            .cloned())
    }

    async fn list_orphans(&self, limit: usize) -> StorageResult<Vec<OrphanDeposit>> {
        let state = self.state.read().await;
        Ok(state.orphans.iter().take(limit).cloned().collect())
    }

    async fn recent_deposits(&self, limit: usize) -> StorageResult<Vec<RecentDeposit>> {
        let state = self.state.read().await;
        Ok(state.recent.iter().take(limit).cloned().collect())
    }

    async fn daily_stats(&self, days: usize) -> StorageResult<Vec<DailyStats>> {
        let state = self.state.read().await;
        Ok(state.daily.values().rev().take(days).cloned().collect())
    }

    async fn scanner_enabled(&self) -> StorageResult<bool> {
        Ok(self.state.read().await.scanner_enabled.unwrap_or(true))
    }

    async fn set_scanner_enabled(&self, enabled: bool) -> StorageResult<()> {
        self.state.write().await.scanner_enabled = Some(enabled);
        Ok(())
    }

    async fn purge_expired(&self, now: u64) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        let before = state.dedup.len();
        state.dedup.retain(|_, record| !record.is_expired(now));
        Ok((before - state.dedup.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DedupStatus, Cursor};

    #[tokio::test]
    async fn test_claim_is_set_if_absent() {
        let store = MemoryLedgerStore::new();

        assert_eq!(store.claim("0xAB", 100).await.unwrap(), ClaimOutcome::Claimed);
        match store.claim("0xab", 101).await.unwrap() {
            ClaimOutcome::Existing(record) => assert_eq!(record.status, DedupStatus::Processing),
            other => panic!("expected existing claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = MemoryLedgerStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim("0xfeed", 5).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_only_own_claim() {
        let store = MemoryLedgerStore::new();
        store.claim("0xaa", 100).await.unwrap();

        assert!(!store.release_claim("0xaa", 99).await.unwrap());
        assert!(store.release_claim("0xaa", 100).await.unwrap());
        assert!(store.get_dedup("0xaa", 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_does_not_regress() {
        let store = MemoryLedgerStore::new();
        store
            .save_checkpoint(&ScanCheckpoint::new(Chain::Eth, Cursor::BlockHeight(50), 1))
            .await
            .unwrap();
        let stored = store
            .save_checkpoint(&ScanCheckpoint::new(Chain::Eth, Cursor::BlockHeight(40), 2))
            .await
            .unwrap();
        assert_eq!(stored.cursor, Cursor::BlockHeight(50));

        assert_eq!(store.clear_checkpoints(None).await.unwrap(), 1);
        assert!(store.get_checkpoint(Chain::Eth).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scanner_flag_defaults_on() {
        let store = MemoryLedgerStore::new();
        assert!(store.scanner_enabled().await.unwrap());
        store.set_scanner_enabled(false).await.unwrap();
        assert!(!store.scanner_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_address_index_normalizes() {
        let store = MemoryLedgerStore::new();
        store.link_address("0xABCDEF", "user-1").await.unwrap();
        assert_eq!(
            store.resolve_user("0xabcdef").await.unwrap(),
            Some("user-1".to_string())
        );
        assert!(store.link_address("0x01", " ").await.is_err());
    }
}
