//! Deposit Pipeline
//!
//! One run: enabled check → aggregated scan → concurrent processing →
//! checkpoint advancement → expiry purge. Runs are triggered by an external
//! at-least-once scheduler (cron endpoint, `scan` command) or by the
//! `worker` loop, and may overlap or repeat.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::common::error::Result;
use crate::common::logging::{generate_correlation_id, log_system_event};
use crate::processor::{DepositProcessor, ProcessOutcome};
use crate::scanner::{ChainError, ScanAggregator};
use crate::storage::LedgerStore;
use crate::types::{unix_now, Chain, ChainScanStatus, DedupStatus, ScanCheckpoint};

/// Deposits processed in parallel within one run
pub const PROCESS_CONCURRENCY: usize = 8;

/// Summary of one pipeline run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineRun {
    pub enabled: bool,
    /// Another run was already in flight in this process
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub deposits_found: usize,
    pub credited: usize,
    pub duplicates: usize,
    pub orphaned: usize,
    pub failed: usize,
    pub errors: Vec<ChainError>,
    pub checkpoints: BTreeMap<Chain, ScanCheckpoint>,
    pub purged: u64,
    pub duration_ms: u64,
}

impl PipelineRun {
    fn disabled() -> Self {
        Self::default()
    }

    fn skipped() -> Self {
        Self {
            enabled: true,
            skipped: true,
            ..Self::default()
        }
    }
}

/// Per-chain view for the admin status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatusView {
    pub chain: Chain,
    pub checkpoint: Option<ScanCheckpoint>,
    #[serde(flatten)]
    pub status: ChainScanStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub enabled: bool,
    pub running: bool,
    pub chains: Vec<ChainStatusView>,
}

/// Scan → process → checkpoint orchestration
pub struct DepositPipeline {
    store: Arc<dyn LedgerStore>,
    aggregator: ScanAggregator,
    processor: DepositProcessor,
    run_guard: Mutex<()>,
}

impl DepositPipeline {
    pub fn new(store: Arc<dyn LedgerStore>, aggregator: ScanAggregator, processor: DepositProcessor) -> Self {
        Self {
            store,
            aggregator,
            processor,
            run_guard: Mutex::new(()),
        }
    }

    pub fn processor(&self) -> &DepositProcessor {
        &self.processor
    }

    /// Execute one run
    pub async fn run_once(&self) -> Result<PipelineRun> {
        if !self.store.scanner_enabled().await? {
            tracing::info!("Deposit scanner disabled, skipping run");
            return Ok(PipelineRun::disabled());
        }

        let Ok(_guard) = self.run_guard.try_lock() else {
            tracing::info!("Deposit scan already running, skipping");
            return Ok(PipelineRun::skipped());
        };

        let started = Instant::now();
        let correlation_id = generate_correlation_id();
        let scan = self.aggregator.scan_all(&correlation_id).await;

        let mut run = PipelineRun {
            enabled: true,
            correlation_id: Some(correlation_id.clone()),
            deposits_found: scan.deposits.len(),
            errors: scan.errors.clone(),
            ..PipelineRun::default()
        };

        let processor = &self.processor;
        let corr = correlation_id.as_str();
        let pending: Vec<_> = scan
            .deposits
            .iter()
            .map(|deposit| async move { (deposit.chain, processor.process(deposit, Some(corr)).await) })
            .collect();
        let results: Vec<(Chain, std::result::Result<ProcessOutcome, _>)> = stream::iter(pending)
            .buffer_unordered(PROCESS_CONCURRENCY)
            .collect()
            .await;

        let mut unfinished: BTreeSet<Chain> = BTreeSet::new();
        for (chain, result) in results {
            match result {
                Ok(ProcessOutcome::Credited { .. }) => run.credited += 1,
                Ok(ProcessOutcome::Duplicate { tx_hash, status }) => {
                    run.duplicates += 1;
                    // Another worker's claim may still be released; rescan until it settles
                    if status == DedupStatus::Processing {
                        unfinished.insert(chain);
                        run.errors.push(ChainError {
                            chain,
                            error: format!("deposit {} still in flight", tx_hash),
                        });
                    }
                }
                Ok(ProcessOutcome::Orphan { .. }) => run.orphaned += 1,
                Err(e) => {
                    run.failed += 1;
                    unfinished.insert(chain);
                    run.errors.push(ChainError {
                        chain,
                        error: format!("deposit processing failed: {}", e),
                    });
                }
            }
        }

        // Checkpoints only move for chains whose deposits all reached a terminal state
        let previous: BTreeMap<Chain, ChainScanStatus> =
            self.store.scan_statuses().await?.into_iter().collect();
        let now = unix_now();

        for (chain, scanned_at) in &scan.scanned_at {
            let mut status = previous.get(chain).cloned().unwrap_or_default();
            status.last_scan_at = Some(*scanned_at);
            status.last_deposit_count = scan.deposit_counts.get(chain).copied().unwrap_or(0);

            match scan.checkpoints.get(chain) {
                Some(checkpoint) if !unfinished.contains(chain) => {
                    match self.store.save_checkpoint(checkpoint).await {
                        Ok(stored) => {
                            run.checkpoints.insert(*chain, stored);
                            status.last_success_at = Some(now);
                            status.last_error = None;
                        }
                        Err(e) => {
                            tracing::warn!(chain = %chain, error = %e, "Failed to persist checkpoint");
                            status.last_error = Some(format!("checkpoint not saved: {}", e));
                        }
                    }
                }
                _ => {
                    status.last_error = run
                        .errors
                        .iter()
                        .find(|e| e.chain == *chain)
                        .map(|e| e.error.clone());
                }
            }

            if let Err(e) = self.store.record_scan_status(*chain, &status).await {
                tracing::warn!(chain = %chain, error = %e, "Failed to record scan status");
            }
        }

        run.purged = match self.store.purge_expired(now).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge expired dedup records");
                0
            }
        };
        run.duration_ms = started.elapsed().as_millis() as u64;

        log_system_event(
            "Deposit scan run complete",
            serde_json::json!({
                "correlation_id": correlation_id,
                "found": run.deposits_found,
                "credited": run.credited,
                "duplicates": run.duplicates,
                "orphaned": run.orphaned,
                "failed": run.failed,
                "chain_errors": run.errors.len(),
                "duration_ms": run.duration_ms,
            }),
        );

        Ok(run)
    }

    pub async fn status(&self) -> Result<ScannerStatus> {
        let enabled = self.store.scanner_enabled().await?;
        let statuses: BTreeMap<Chain, ChainScanStatus> =
            self.store.scan_statuses().await?.into_iter().collect();

        let mut chains = Vec::new();
        for chain in self.aggregator.chains() {
            chains.push(ChainStatusView {
                chain,
                checkpoint: self.store.get_checkpoint(chain).await?,
                status: statuses.get(&chain).cloned().unwrap_or_default(),
            });
        }

        Ok(ScannerStatus {
            enabled,
            running: self.run_guard.try_lock().is_err(),
            chains,
        })
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store.set_scanner_enabled(enabled).await?;
        log_system_event("Deposit scanner toggled", serde_json::json!({ "enabled": enabled }));
        Ok(())
    }

    /// Clear checkpoints so the next run starts from a fresh lookback window
    pub async fn rescan(&self, chain: Option<Chain>) -> Result<u64> {
        let cleared = self.store.clear_checkpoints(chain).await?;
        log_system_event(
            "Scan checkpoints cleared",
            serde_json::json!({
                "chain": chain.map(|c| c.as_str()),
                "cleared": cleared,
            }),
        );
        Ok(cleared)
    }

    /// Run on a fixed interval until `shutdown` resolves
    pub async fn run_loop<F>(&self, every: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(every);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Worker loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Deposit scan run failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{PriceBook, StaticOracle};
    use crate::processor::BonusSchedule;
    use crate::scanner::stub::StubScanner;
    use crate::scanner::ChainScanner;
    use crate::storage::MemoryLedgerStore;
    use crate::types::{ClaimOutcome, Coin, Cursor, Deposit};

    fn pipeline(store: Arc<MemoryLedgerStore>, scanners: Vec<Arc<dyn ChainScanner>>) -> DepositPipeline {
        let aggregator = ScanAggregator::new(scanners, store.clone(), Duration::from_secs(5));
        let processor = DepositProcessor::new(
            store.clone(),
            PriceBook::new(Arc::new(StaticOracle)),
            BonusSchedule::default(),
        );
        DepositPipeline::new(store, aggregator, processor)
    }

    fn deposit(chain: Chain, coin: Coin, hash: &str, sender: &str) -> Deposit {
        Deposit::new(chain, coin, hash, sender, "custody", 1.0, 100)
    }

    #[tokio::test]
    async fn test_failing_chain_does_not_block_others() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address("alice", "user-a").await.unwrap();
        let pipeline = pipeline(
            store.clone(),
            vec![
                Arc::new(StubScanner::failing(Chain::Btc, "esplora unreachable")),
                Arc::new(StubScanner::ok(
                    Chain::Sol,
                    vec![deposit(Chain::Sol, Coin::Sol, "sigA", "alice")],
                    42,
                )),
            ],
        );

        let run = pipeline.run_once().await.unwrap();

        assert_eq!(run.credited, 1);
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].chain, Chain::Btc);
        assert!(store.get_checkpoint(Chain::Btc).await.unwrap().is_none());
        assert_eq!(
            store.get_checkpoint(Chain::Sol).await.unwrap().map(|c| c.cursor),
            Some(Cursor::BlockHeight(42))
        );
        assert_eq!(store.get_balance("user-a").await.unwrap().platform_units(), 200.0);

        let statuses: BTreeMap<Chain, ChainScanStatus> =
            store.scan_statuses().await.unwrap().into_iter().collect();
        assert!(statuses[&Chain::Btc].last_error.as_deref().unwrap_or("").contains("esplora"));
        assert!(statuses[&Chain::Sol].last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_repeated_runs_are_idempotent() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address("alice", "user-a").await.unwrap();
        let pipeline = pipeline(
            store.clone(),
            vec![Arc::new(StubScanner::ok(
                Chain::Eth,
                vec![
                    deposit(Chain::Eth, Coin::Eth, "0x01", "alice"),
                    deposit(Chain::Eth, Coin::Usdc, "0x02", "bob"),
                ],
                10,
            ))],
        );

        let first = pipeline.run_once().await.unwrap();
        assert_eq!((first.credited, first.orphaned), (1, 1));

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.get_balance("user-a").await.unwrap().platform_units(), 3_500.0);
        assert_eq!(store.list_orphans(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_claim_holds_checkpoint() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.link_address("alice", "user-a").await.unwrap();
        let stamp = unix_now();
        assert_eq!(store.claim("sigP", stamp).await.unwrap(), ClaimOutcome::Claimed);

        let pipeline = pipeline(
            store.clone(),
            vec![Arc::new(StubScanner::ok(
                Chain::Sol,
                vec![deposit(Chain::Sol, Coin::Sol, "sigP", "alice")],
                42,
            ))],
        );

        let run = pipeline.run_once().await.unwrap();
        assert_eq!((run.duplicates, run.credited), (1, 0));
        assert!(store.get_checkpoint(Chain::Sol).await.unwrap().is_none());

        // The other worker gives up; the next run picks the deposit up again
        assert!(store.release_claim("sigP", stamp).await.unwrap());
        let run = pipeline.run_once().await.unwrap();
        assert_eq!(run.credited, 1);
        assert_eq!(
            store.get_checkpoint(Chain::Sol).await.unwrap().map(|c| c.cursor),
            Some(Cursor::BlockHeight(42))
        );
        assert_eq!(store.get_balance("user-a").await.unwrap().platform_units(), 200.0);
    }

    #[tokio::test]
    async fn test_disabled_scanner_does_nothing() {
        let store = Arc::new(MemoryLedgerStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![Arc::new(StubScanner::ok(Chain::Eth, vec![], 10))],
        );

        pipeline.set_enabled(false).await.unwrap();
        let run = pipeline.run_once().await.unwrap();

        assert!(!run.enabled);
        assert!(store.get_checkpoint(Chain::Eth).await.unwrap().is_none());
        assert_eq!(serde_json::to_value(&run).unwrap()["enabled"], false);
    }

    #[tokio::test]
    async fn test_rescan_clears_checkpoints() {
        let store = Arc::new(MemoryLedgerStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![
                Arc::new(StubScanner::ok(Chain::Eth, vec![], 10)),
                Arc::new(StubScanner::ok(Chain::Btc, vec![], 20)),
            ],
        );
        pipeline.run_once().await.unwrap();

        assert_eq!(pipeline.rescan(Some(Chain::Eth)).await.unwrap(), 1);
        assert!(store.get_checkpoint(Chain::Eth).await.unwrap().is_none());
        assert!(store.get_checkpoint(Chain::Btc).await.unwrap().is_some());

        let status = pipeline.status().await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.chains.len(), 2);
    }
}
