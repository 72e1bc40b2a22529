//! Ethereum Scanner
//!
//! Native ETH transfers are read from full blocks; USDT/USDC transfers from
//! ERC-20 `Transfer` logs of the configured contracts. Only blocks at least
//! `confirmations` deep are scanned.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use super::rpc::JsonRpcClient;
use super::{coalesce_by_tx, ChainScanner, ScanBatch, ScanError};
use crate::common::config::{ChainEndpoint, TokenContract};
use crate::types::units::{parse_hex_quantity, scale_token_amount, unix_now, wei_to_eth};
use crate::types::{Chain, Coin, Cursor, Deposit, ScanCheckpoint};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Upper bound on blocks fetched per scan
pub const MAX_BLOCKS_PER_SCAN: u64 = 100;

/// Blocks below the safe tip scanned when no checkpoint exists
pub const INITIAL_LOOKBACK_BLOCKS: u64 = 100;

const BLOCK_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct EthTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthBlock {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<EthTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    #[serde(default)]
    pub removed: bool,
}

fn hex_u64(field: &str, value: &str) -> Result<u64, ScanError> {
    parse_hex_quantity(value)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| ScanError::Parse(format!("{}: bad quantity {}", field, value)))
}

/// Address held in the low 20 bytes of an indexed topic
fn topic_address(topic: &str) -> Option<String> {
    let bytes = hex::decode(topic.strip_prefix("0x").unwrap_or(topic)).ok()?;
    if bytes.len() != 32 || bytes[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(&bytes[12..])))
}

/// Left-pad an address to a 32-byte topic
fn address_topic(address: &str) -> String {
    let digits = address.strip_prefix("0x").unwrap_or(address).to_lowercase();
    format!("0x{:0>64}", digits)
}

/// Native ETH transfers into custody addresses from one block
pub fn native_deposits(block: &EthBlock, custody: &[String]) -> Result<Vec<Deposit>, ScanError> {
    let observed_at = hex_u64("timestamp", &block.timestamp)?;
    let mut out = Vec::new();

    for tx in &block.transactions {
        let Some(to) = tx.to.as_deref().map(str::to_lowercase) else {
            continue;
        };
        let from = tx.from.to_lowercase();
        if !custody.contains(&to) || custody.contains(&from) {
            continue;
        }

        let wei = parse_hex_quantity(&tx.value)
            .ok_or_else(|| ScanError::Parse(format!("value of {}: {}", tx.hash, tx.value)))?;
        if wei == 0 {
            continue;
        }

        out.push(Deposit::new(
            Chain::Eth,
            Coin::Eth,
            tx.hash.clone(),
            from,
            to,
            wei_to_eth(wei),
            observed_at,
        ));
    }

    Ok(out)
}

/// Stablecoin transfers into custody addresses from `Transfer` logs
pub fn token_deposits(
    logs: &[EthLog],
    tokens: &[TokenContract],
    custody: &[String],
    timestamps: &HashMap<u64, u64>,
) -> Result<Vec<Deposit>, ScanError> {
    let mut out = Vec::new();

    for log in logs {
        if log.removed || log.topics.len() < 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
            continue;
        }
        let contract = log.address.to_lowercase();
        let Some(token) = tokens.iter().find(|t| t.contract == contract) else {
            continue;
        };
        let (Some(from), Some(to)) = (topic_address(&log.topics[1]), topic_address(&log.topics[2])) else {
            continue;
        };
        if !custody.contains(&to) || custody.contains(&from) {
            continue;
        }

        let raw = match parse_hex_quantity(&log.data) {
            Some(raw) if raw > 0 => raw,
            Some(_) => continue,
            None => {
                tracing::warn!(tx = %log.transaction_hash, "Skipping token transfer with unparseable amount");
                continue;
            }
        };

        let height = hex_u64("blockNumber", &log.block_number)?;
        let observed_at = timestamps.get(&height).copied().ok_or_else(|| {
            ScanError::Parse(format!("log {} outside scanned range", log.transaction_hash))
        })?;

        out.push(Deposit::new(
            Chain::Eth,
            token.coin,
            log.transaction_hash.clone(),
            from,
            to,
            scale_token_amount(raw, token.decimals),
            observed_at,
        ));
    }

    Ok(out)
}

/// Block range to scan, or `None` when there is nothing new below the safe tip
pub fn scan_range(previous: Option<u64>, safe_tip: u64) -> Option<(u64, u64)> {
    let from = match previous {
        Some(height) => height + 1,
        None => safe_tip.saturating_sub(INITIAL_LOOKBACK_BLOCKS) + 1,
    };
    if from > safe_tip {
        return None;
    }
    Some((from, safe_tip.min(from + MAX_BLOCKS_PER_SCAN - 1)))
}

/// Ethereum deposit scanner
pub struct EthScanner {
    rpc: JsonRpcClient,
    custody: Vec<String>,
    confirmations: u64,
    tokens: Vec<TokenContract>,
}

impl EthScanner {
    pub fn new(client: Client, endpoint: &ChainEndpoint, tokens: Vec<TokenContract>) -> Self {
        Self {
            rpc: JsonRpcClient::new(client, &endpoint.rpc_url),
            custody: endpoint
                .custody_addresses
                .iter()
                .map(|a| a.to_lowercase())
                .collect(),
            confirmations: endpoint.confirmations,
            tokens,
        }
    }

    async fn block_number(&self) -> Result<u64, ScanError> {
        let tip: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        hex_u64("eth_blockNumber", &tip)
    }

    async fn block(&self, height: u64) -> Result<EthBlock, ScanError> {
        let block: Option<EthBlock> = self
            .rpc
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", height), true]))
            .await?;
        block.ok_or_else(|| ScanError::Parse(format!("block {} not available", height)))
    }

    async fn transfer_logs(&self, from: u64, to: u64) -> Result<Vec<EthLog>, ScanError> {
        let contracts: Vec<&str> = self.tokens.iter().map(|t| t.contract.as_str()).collect();
        let recipients: Vec<String> = self.custody.iter().map(|a| address_topic(a)).collect();

        let filter = json!({
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", to),
            "address": contracts,
            "topics": [TRANSFER_TOPIC, null, recipients],
        });
        self.rpc.call("eth_getLogs", json!([filter])).await
    }
}

#[async_trait]
impl ChainScanner for EthScanner {
    fn chain(&self) -> Chain {
        Chain::Eth
    }

    async fn scan(&self, checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError> {
        let previous = checkpoint.and_then(|c| c.cursor.height());
        let tip = self.block_number().await?;
        let safe_tip = tip.saturating_sub(self.confirmations);

        let Some((from, to)) = scan_range(previous, safe_tip) else {
            let height = previous.unwrap_or(safe_tip);
            return Ok(ScanBatch {
                deposits: Vec::new(),
                checkpoint: ScanCheckpoint::new(Chain::Eth, Cursor::BlockHeight(height), unix_now()),
            });
        };

        let blocks: Vec<EthBlock> = stream::iter(from..=to)
            .map(|height| self.block(height))
            .buffered(BLOCK_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut deposits = Vec::new();
        let mut timestamps = HashMap::new();
        for block in &blocks {
            let height = hex_u64("number", &block.number)?;
            timestamps.insert(height, hex_u64("timestamp", &block.timestamp)?);
            deposits.extend(native_deposits(block, &self.custody)?);
        }

        if !self.tokens.is_empty() {
            let logs = self.transfer_logs(from, to).await?;
            deposits.extend(token_deposits(&logs, &self.tokens, &self.custody, &timestamps)?);
        }

        tracing::debug!(from, to, found = deposits.len(), "Scanned Ethereum blocks");

        Ok(ScanBatch {
            deposits: coalesce_by_tx(deposits),
            checkpoint: ScanCheckpoint::new(Chain::Eth, Cursor::BlockHeight(to), unix_now()),
        })
    }
}
