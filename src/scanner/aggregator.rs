//! Scan Aggregator
//!
//! Runs every chain scanner concurrently under a per-chain timeout and
//! merges the results into one ordered deposit stream. A failing or slow
//! chain only contributes an error entry.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ChainScanner, ScanError};
use crate::common::logging::log_scan_event;
use crate::storage::LedgerStore;
use crate::types::{unix_now, Chain, Deposit, ScanCheckpoint};

/// A chain that produced no usable output this run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainError {
    pub chain: Chain,
    pub error: String,
}

/// Result of scanning one chain
#[derive(Debug, Clone)]
pub struct ChainScanOutcome {
    pub chain: Chain,
    pub scanned_at: u64,
    pub duration_ms: u64,
    pub result: Result<(Vec<Deposit>, ScanCheckpoint), String>,
}

/// Merged result of one aggregated scan
#[derive(Debug, Clone, Default)]
pub struct AggregatedScan {
    /// Deposits of every successful chain, ordered by (observed_at, chain, tx_hash)
    pub deposits: Vec<Deposit>,
    pub errors: Vec<ChainError>,
    /// Proposed checkpoints of successful chains
    pub checkpoints: BTreeMap<Chain, ScanCheckpoint>,
    pub scanned_at: BTreeMap<Chain, u64>,
    pub deposit_counts: BTreeMap<Chain, usize>,
}

impl AggregatedScan {
    pub fn succeeded(&self, chain: Chain) -> bool {
        self.checkpoints.contains_key(&chain)
    }
}

/// Fans out to every configured chain scanner
pub struct ScanAggregator {
    scanners: Vec<Arc<dyn ChainScanner>>,
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
}

impl ScanAggregator {
    pub fn new(scanners: Vec<Arc<dyn ChainScanner>>, store: Arc<dyn LedgerStore>, timeout: Duration) -> Self {
        Self {
            scanners,
            store,
            timeout,
        }
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.scanners.iter().map(|s| s.chain()).collect()
    }

    async fn scan_chain(&self, scanner: &dyn ChainScanner, correlation_id: &str) -> ChainScanOutcome {
        let chain = scanner.chain();
        let started = Instant::now();
        let scanned_at = unix_now();

        let result = match self.store.get_checkpoint(chain).await {
            Err(e) => Err(ScanError::Checkpoint(e.to_string())),
            Ok(checkpoint) => match tokio::time::timeout(self.timeout, scanner.scan(checkpoint.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(ScanError::Timeout(self.timeout)),
            },
        };

        let result = result
            .map(|batch| {
                let deposits: Vec<Deposit> = batch
                    .deposits
                    .into_iter()
                    .filter(|d| match d.validate() {
                        Ok(()) => d.chain == chain,
                        Err(e) => {
                            tracing::warn!(chain = %chain, tx = %d.tx_hash, error = %e, "Dropping invalid deposit");
                            false
                        }
                    })
                    .collect();
                (deposits, batch.checkpoint)
            })
            .map_err(|e| e.to_string());

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok((deposits, _)) => log_scan_event(chain.as_str(), deposits.len(), duration_ms, correlation_id, None),
            Err(e) => log_scan_event(chain.as_str(), 0, duration_ms, correlation_id, Some(e)),
        }

        ChainScanOutcome {
            chain,
            scanned_at,
            duration_ms,
            result,
        }
    }

    /// Scan every chain once
    pub async fn scan_all(&self, correlation_id: &str) -> AggregatedScan {
        let outcomes = join_all(
            self.scanners
                .iter()
                .map(|scanner| self.scan_chain(scanner.as_ref(), correlation_id)),
        )
        .await;

        let mut aggregated = AggregatedScan::default();
        for outcome in outcomes {
            aggregated.scanned_at.insert(outcome.chain, outcome.scanned_at);
            match outcome.result {
                Ok((deposits, checkpoint)) => {
                    aggregated.deposit_counts.insert(outcome.chain, deposits.len());
                    aggregated.checkpoints.insert(outcome.chain, checkpoint);
                    aggregated.deposits.extend(deposits);
                }
                Err(error) => aggregated.errors.push(ChainError {
                    chain: outcome.chain,
                    error,
                }),
            }
        }

        aggregated.deposits.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then(a.chain.cmp(&b.chain))
                .then_with(|| a.canonical_tx_hash().cmp(&b.canonical_tx_hash()))
        });

        aggregated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::stub::StubScanner;
    use crate::storage::MemoryLedgerStore;
    use crate::types::Coin;

    fn deposit(chain: Chain, coin: Coin, hash: &str, at: u64) -> Deposit {
        Deposit::new(chain, coin, hash, "sender", "custody", 1.0, at)
    }

    #[tokio::test]
    async fn test_failing_chain_is_isolated() {
        let scanners: Vec<Arc<dyn ChainScanner>> = vec![
            Arc::new(StubScanner::ok(Chain::Eth, vec![deposit(Chain::Eth, Coin::Eth, "0x02", 20)], 100)),
            Arc::new(StubScanner::failing(Chain::Btc, "esplora down")),
            Arc::new(StubScanner::ok(Chain::Sol, vec![deposit(Chain::Sol, Coin::Sol, "sigA", 10)], 5)),
        ];
        let aggregator = ScanAggregator::new(scanners, Arc::new(MemoryLedgerStore::new()), Duration::from_secs(5));

        let scan = aggregator.scan_all("test").await;

        assert_eq!(scan.deposits.len(), 2);
        assert_eq!(scan.deposits[0].chain, Chain::Sol);
        assert_eq!(scan.deposits[1].chain, Chain::Eth);
        assert_eq!(scan.errors.len(), 1);
        assert_eq!(scan.errors[0].chain, Chain::Btc);
        assert!(scan.errors[0].error.contains("esplora down"));
        assert!(scan.succeeded(Chain::Eth));
        assert!(!scan.succeeded(Chain::Btc));
        assert_eq!(scan.scanned_at.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_chain_times_out() {
        let scanners: Vec<Arc<dyn ChainScanner>> = vec![
            Arc::new(StubScanner::hanging(Chain::Xrp)),
            Arc::new(StubScanner::ok(Chain::Eth, vec![deposit(Chain::Eth, Coin::Eth, "0x01", 1)], 1)),
        ];
        let aggregator = ScanAggregator::new(scanners, Arc::new(MemoryLedgerStore::new()), Duration::from_secs(25));

        let scan = aggregator.scan_all("test").await;

        assert_eq!(scan.deposits.len(), 1);
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.errors[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_deposits_dropped_and_order_is_stable() {
        let mut bad = deposit(Chain::Eth, Coin::Eth, "0xbad", 5);
        bad.amount = -1.0;
        let scanners: Vec<Arc<dyn ChainScanner>> = vec![Arc::new(StubScanner::ok(
            Chain::Eth,
            vec![
                deposit(Chain::Eth, Coin::Eth, "0xbb", 5),
                bad,
                deposit(Chain::Eth, Coin::Usdc, "0xAA", 5),
            ],
            10,
        ))];
        let aggregator = ScanAggregator::new(scanners, Arc::new(MemoryLedgerStore::new()), Duration::from_secs(5));

        let scan = aggregator.scan_all("test").await;

        let hashes: Vec<&str> = scan.deposits.iter().map(|d| d.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xAA", "0xbb"]);
        assert_eq!(scan.deposit_counts.get(&Chain::Eth), Some(&2));
    }
}
