//! Chain Scanners
//!
//! One scanner per chain polls its data source for transfers into custody
//! addresses since the last persisted checkpoint. Scanners never touch
//! storage: they return the deposits they found and the checkpoint the
//! caller may persist once those deposits are handled.

pub mod aggregator;
pub mod btc;
pub mod eth;
pub mod rpc;
pub mod sol;
pub mod xrp;

#[cfg(test)]
pub(crate) mod stub;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::common::config::LedgerConfig;
use crate::types::{Chain, Deposit, ScanCheckpoint};

pub use aggregator::{AggregatedScan, ChainError, ChainScanOutcome, ScanAggregator};
pub use btc::BtcScanner;
pub use eth::EthScanner;
pub use sol::SolScanner;
pub use xrp::XrpScanner;

/// Per-request timeout of outbound chain calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Scan errors
///
/// Every variant is transient from the pipeline's point of view: the chain
/// is skipped for this run and retried on the next one.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("scan timed out after {0:?}")]
    Timeout(Duration),

    #[error("checkpoint unavailable: {0}")]
    Checkpoint(String),
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        ScanError::Transport(e.to_string())
    }
}

/// Output of one successful scan
#[derive(Debug, Clone)]
pub struct ScanBatch {
    pub deposits: Vec<Deposit>,
    pub checkpoint: ScanCheckpoint,
}

/// A chain-specific deposit source
#[async_trait]
pub trait ChainScanner: Send + Sync {
    fn chain(&self) -> Chain;

    /// Scan for confirmed deposits after `checkpoint`.
    ///
    /// `None` starts from a bounded lookback below the safe tip. On error
    /// nothing is returned and the caller keeps its stored checkpoint.
    async fn scan(&self, checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError>;
}

/// HTTP client shared by the scanners of one process
pub fn http_client() -> Result<reqwest::Client, ScanError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ScanError::from)
}

/// Build a scanner for every chain that has custody addresses configured
pub fn build_scanners(config: &LedgerConfig) -> Result<Vec<Arc<dyn ChainScanner>>, ScanError> {
    let client = http_client()?;
    let mut scanners: Vec<Arc<dyn ChainScanner>> = Vec::new();

    if config.eth.is_enabled() {
        scanners.push(Arc::new(EthScanner::new(
            client.clone(),
            &config.eth,
            config.eth_tokens.clone(),
        )));
    }
    if config.btc.is_enabled() {
        scanners.push(Arc::new(BtcScanner::new(client.clone(), &config.btc)));
    }
    if config.xrp.is_enabled() {
        scanners.push(Arc::new(XrpScanner::new(client.clone(), &config.xrp)));
    }
    if config.sol.is_enabled() {
        scanners.push(Arc::new(SolScanner::new(client, &config.sol)));
    }

    Ok(scanners)
}

/// Collapse transfers that share a transaction hash.
///
/// Several outputs of one transaction to custody addresses become one
/// deposit. When one transaction moves different coins, the first coin keeps
/// the plain hash and the others are keyed `{hash}:{coin}` so none of them is
/// swallowed by deduplication.
pub fn coalesce_by_tx(deposits: Vec<Deposit>) -> Vec<Deposit> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: BTreeMap<String, Vec<Deposit>> = BTreeMap::new();

    for deposit in deposits {
        let hash = deposit.canonical_tx_hash();
        let group = merged.entry(hash.clone()).or_insert_with(|| {
            order.push(hash.clone());
            Vec::new()
        });

        match group.iter_mut().find(|d| d.coin == deposit.coin) {
            Some(existing) => existing.amount += deposit.amount,
            None => group.push(deposit),
        }
    }

    let mut out = Vec::new();
    for hash in order {
        if let Some(group) = merged.remove(&hash) {
            for (i, mut deposit) in group.into_iter().enumerate() {
                deposit.tx_hash = if i == 0 {
                    hash.clone()
                } else {
                    format!("{}:{}", hash, deposit.coin.as_str().to_lowercase())
                };
                out.push(deposit);
            }
        }
    }
    out
}
