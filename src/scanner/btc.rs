//! Bitcoin Scanner
//!
//! Reads custody address histories from an Esplora REST API. A transaction
//! paying several custody outputs becomes a single deposit.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use super::{ChainScanner, ScanBatch, ScanError};
use crate::common::config::ChainEndpoint;
use crate::types::units::{sats_to_btc, unix_now};
use crate::types::{Chain, Coin, Cursor, Deposit, ResumePoint, ScanCheckpoint};

/// Blocks below the safe tip scanned when no checkpoint exists (~1 day)
pub const INITIAL_LOOKBACK_BLOCKS: u64 = 144;

/// History pages fetched per address per scan
pub const MAX_PAGES_PER_ADDRESS: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraOutput {
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraInput {
    pub prevout: Option<EsploraOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub block_time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<EsploraInput>,
    #[serde(default)]
    pub vout: Vec<EsploraOutput>,
    pub status: EsploraStatus,
}

/// Deposit carried by one confirmed transaction, if any
///
/// Transactions funded only by custody addresses are internal movements and
/// are ignored.
pub fn tx_deposit(tx: &EsploraTx, custody: &[String]) -> Option<Deposit> {
    if !tx.status.confirmed {
        return None;
    }

    let senders: Vec<&str> = tx
        .vin
        .iter()
        .filter_map(|i| i.prevout.as_ref()?.scriptpubkey_address.as_deref())
        .collect();
    let external_sender = senders
        .into_iter()
        .find(|a| !custody.iter().any(|c| c.as_str() == *a))?;

    let mut to_address: Option<&str> = None;
    let mut sats: u64 = 0;
    for out in &tx.vout {
        if let Some(addr) = out.scriptpubkey_address.as_deref() {
            if custody.iter().any(|c| c.as_str() == addr) {
                to_address.get_or_insert(addr);
                sats += out.value;
            }
        }
    }
    if sats == 0 {
        return None;
    }

    Some(Deposit::new(
        Chain::Btc,
        Coin::Btc,
        tx.txid.clone(),
        external_sender,
        to_address?,
        sats_to_btc(sats),
        tx.status.block_time.unwrap_or(0),
    ))
}

/// Height window `(from, to]` covered by a scan
pub fn scan_window(previous: Option<u64>, tip: u64, confirmations: u64) -> (u64, u64) {
    let safe_tip = (tip + 1).saturating_sub(confirmations.max(1));
    let floor = match previous {
        Some(height) => height,
        None => safe_tip.saturating_sub(INITIAL_LOOKBACK_BLOCKS),
    };
    (floor.min(safe_tip), safe_tip)
}

/// One newest-first walk over an address history
#[derive(Debug, Default)]
pub struct HistoryWalk {
    pub txs: Vec<EsploraTx>,
    /// Oldest txid read when the page limit cut the walk short
    pub resume_before: Option<String>,
}

/// Bitcoin deposit scanner
pub struct BtcScanner {
    client: Client,
    base_url: String,
    custody: Vec<String>,
    confirmations: u64,
}

impl BtcScanner {
    pub fn new(client: Client, endpoint: &ChainEndpoint) -> Self {
        Self {
            client,
            base_url: endpoint.rpc_url.trim_end_matches('/').to_string(),
            custody: endpoint.custody_addresses.clone(),
            confirmations: endpoint.confirmations,
        }
    }

    async fn tip_height(&self) -> Result<u64, ScanError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ScanError::Transport(format!("tip height: HTTP {}", resp.status())));
        }

        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|_| ScanError::Parse("tip height".to_string()))
    }

    async fn address_page(&self, address: &str, last_seen: Option<&str>) -> Result<Vec<EsploraTx>, ScanError> {
        let url = match last_seen {
            Some(txid) => format!("{}/address/{}/txs/chain/{}", self.base_url, address, txid),
            None => format!("{}/address/{}/txs", self.base_url, address),
        };
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ScanError::Transport(format!(
                "history of {}: HTTP {}",
                address,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Confirmed transactions of `address` with height in `(floor, ceiling]`,
    /// walking down from just below `start` when given
    async fn history(
        &self,
        address: &str,
        floor: u64,
        ceiling: u64,
        start: Option<&str>,
    ) -> Result<HistoryWalk, ScanError> {
        let mut walk = HistoryWalk::default();
        let mut last_seen: Option<String> = start.map(str::to_string);

        for _ in 0..MAX_PAGES_PER_ADDRESS {
            let page = self.address_page(address, last_seen.as_deref()).await?;
            let confirmed: Vec<EsploraTx> = page.into_iter().filter(|t| t.status.confirmed).collect();
            let Some(last) = confirmed.last() else {
                return Ok(walk);
            };
            last_seen = Some(last.txid.clone());

            let mut reached_floor = false;
            for tx in confirmed {
                match tx.status.block_height {
                    Some(h) if h <= floor => reached_floor = true,
                    Some(h) if h <= ceiling => walk.txs.push(tx),
                    _ => {}
                }
            }
            if reached_floor {
                return Ok(walk);
            }
        }

        tracing::warn!(address, floor, "Bitcoin history truncated at page limit, resuming next scan");
        walk.resume_before = last_seen;
        Ok(walk)
    }
}

#[async_trait]
impl ChainScanner for BtcScanner {
    fn chain(&self) -> Chain {
        Chain::Btc
    }

    async fn scan(&self, checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError> {
        let previous = checkpoint.and_then(|c| c.cursor.height());
        let tip = self.tip_height().await?;
        let (floor, ceiling) = scan_window(previous, tip, self.confirmations);

        let stored = checkpoint.map(|c| c.resume.clone()).unwrap_or_default();

        // An interrupted walk finishes its own window first; the cursor only
        // rises to the lowest height every address is fully read to
        let mut deposits = Vec::new();
        let mut resume = BTreeMap::new();
        let mut covered = ceiling;
        let mut seen = HashSet::new();
        for address in &self.custody {
            let point = stored.get(address);
            let top = point.and_then(|p| p.ceiling).unwrap_or(ceiling).min(ceiling);
            if top <= floor {
                continue;
            }

            let walk = self
                .history(address, floor, top, point.map(|p| p.before.as_str()))
                .await?;
            for tx in walk.txs {
                if !seen.insert(tx.txid.clone()) {
                    continue;
                }
                if let Some(deposit) = tx_deposit(&tx, &self.custody) {
                    deposits.push(deposit);
                }
            }

            match walk.resume_before {
                Some(before) => {
                    resume.insert(
                        address.clone(),
                        ResumePoint {
                            before,
                            ceiling: Some(top),
                        },
                    );
                    covered = floor;
                }
                None => covered = covered.min(top),
            }
        }

        let cursor = covered.max(previous.unwrap_or(0));
        tracing::debug!(floor, ceiling, cursor, found = deposits.len(), "Scanned Bitcoin addresses");

        Ok(ScanBatch {
            deposits,
            checkpoint: ScanCheckpoint::new(Chain::Btc, Cursor::BlockHeight(cursor), unix_now())
                .with_resume(resume),
        })
    }
}
