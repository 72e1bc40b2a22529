//! Solana Scanner
//!
//! Lists finalized signatures touching each custody account since the last
//! processed one and reads the lamport balance change of the account from
//! each transaction.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::rpc::JsonRpcClient;
use super::{ChainScanner, ScanBatch, ScanError};
use crate::common::config::ChainEndpoint;
use crate::types::units::{lamports_to_sol, unix_now};
use crate::types::{Chain, Coin, Cursor, Deposit, ResumePoint, ScanCheckpoint};

/// Signatures read on the first scan of an account
pub const INITIAL_LOOKBACK_SIGNATURES: usize = 100;

/// Transactions processed per account per scan, oldest first
pub const MAX_TX_PER_ACCOUNT: usize = 100;

const SIGNATURE_PAGE_LIMIT: usize = 1_000;
const MAX_SIGNATURE_PAGES: usize = 10;
const TX_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub err: Option<Value>,
    pub block_time: Option<i64>,
}

fn account_key(key: &Value) -> Option<&str> {
    key.as_str().or_else(|| key.get("pubkey")?.as_str())
}

/// Deposit to `custody` carried by one `jsonParsed` transaction, if any
pub fn lamport_deposit(signature: &str, tx: &Value, custody: &str) -> Option<Deposit> {
    let meta = tx.get("meta")?;
    if !meta.get("err").map_or(true, Value::is_null) {
        return None;
    }

    let keys = tx.get("transaction")?.get("message")?.get("accountKeys")?.as_array()?;
    let sender = account_key(keys.first()?)?;
    if sender == custody {
        return None;
    }
    let index = keys.iter().position(|k| account_key(k) == Some(custody))?;

    let pre = meta.get("preBalances")?.as_array()?.get(index)?.as_u64()?;
    let post = meta.get("postBalances")?.as_array()?.get(index)?.as_u64()?;
    if post <= pre {
        return None;
    }

    let observed_at = tx
        .get("blockTime")
        .and_then(Value::as_i64)
        .and_then(|t| u64::try_from(t).ok())
        .unwrap_or(0);

    Some(Deposit::new(
        Chain::Sol,
        Coin::Sol,
        signature,
        sender,
        custody,
        lamports_to_sol(post - pre),
        observed_at,
    ))
}

/// Oldest-first slice of `newest_first` to process this run
pub fn next_batch(mut newest_first: Vec<SignatureInfo>) -> Vec<SignatureInfo> {
    newest_first.reverse();
    newest_first.truncate(MAX_TX_PER_ACCOUNT);
    newest_first
}

/// Signatures of one account newer than its cursor, newest first
#[derive(Debug, Default)]
pub struct SignatureWalk {
    pub signatures: Vec<SignatureInfo>,
    /// The page limit stopped the walk before it reached the cursor
    pub truncated: bool,
}

/// Signatures to process for one account, and the anchor its next walk
/// starts below
///
/// A truncated walk processes nothing. It continues next scan from the newest
/// signature of its last page, which keeps the gap above the anchor inside a
/// single walk. A walk that reaches the cursor yields its oldest signatures;
/// the anchor stays until everything below it has been processed.
pub fn plan_account(walk: SignatureWalk, anchor: Option<String>) -> (Vec<SignatureInfo>, Option<String>) {
    if walk.truncated {
        let last_page = walk.signatures.len().saturating_sub(SIGNATURE_PAGE_LIMIT);
        let next = walk
            .signatures
            .get(last_page)
            .map(|s| s.signature.clone())
            .or(anchor);
        return (Vec::new(), next);
    }

    let pending = walk.signatures.len();
    let batch = next_batch(walk.signatures);
    let anchor = if pending > batch.len() { anchor } else { None };
    (batch, anchor)
}

/// Solana deposit scanner
pub struct SolScanner {
    rpc: JsonRpcClient,
    accounts: Vec<String>,
}

impl SolScanner {
    pub fn new(client: Client, endpoint: &ChainEndpoint) -> Self {
        Self {
            rpc: JsonRpcClient::new(client, &endpoint.rpc_url),
            accounts: endpoint.custody_addresses.clone(),
        }
    }

    /// Finalized signatures newer than `until` and older than `before`,
    /// newest first
    async fn signatures_since(
        &self,
        account: &str,
        until: Option<&str>,
        before: Option<&str>,
    ) -> Result<SignatureWalk, ScanError> {
        let Some(until) = until else {
            let signatures = self
                .rpc
                .call(
                    "getSignaturesForAddress",
                    json!([account, {"limit": INITIAL_LOOKBACK_SIGNATURES, "commitment": "finalized"}]),
                )
                .await?;
            return Ok(SignatureWalk {
                signatures,
                truncated: false,
            });
        };

        let mut walk = SignatureWalk::default();
        for _ in 0..MAX_SIGNATURE_PAGES {
            let mut options = json!({
                "limit": SIGNATURE_PAGE_LIMIT,
                "until": until,
                "commitment": "finalized",
            });
            if let Some(below) = walk.signatures.last().map(|s| s.signature.as_str()).or(before) {
                options["before"] = json!(below);
            }

            let page: Vec<SignatureInfo> = self
                .rpc
                .call("getSignaturesForAddress", json!([account, options]))
                .await?;
            let full = page.len() == SIGNATURE_PAGE_LIMIT;
            walk.signatures.extend(page);
            if !full {
                return Ok(walk);
            }
        }

        tracing::warn!(
            account,
            count = walk.signatures.len(),
            "Solana signature backlog exceeds page limit, resuming next scan"
        );
        walk.truncated = true;
        Ok(walk)
    }

    async fn transaction(&self, signature: &str) -> Result<Value, ScanError> {
        let tx: Option<Value> = self
            .rpc
            .call(
                "getTransaction",
                json!([signature, {
                    "encoding": "jsonParsed",
                    "commitment": "finalized",
                    "maxSupportedTransactionVersion": 0
                }]),
            )
            .await?;
        tx.ok_or_else(|| ScanError::Parse(format!("transaction {} not available", signature)))
    }
}

#[async_trait]
impl ChainScanner for SolScanner {
    fn chain(&self) -> Chain {
        Chain::Sol
    }

    async fn scan(&self, checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError> {
        let previous = match checkpoint.map(|c| &c.cursor) {
            Some(Cursor::Signatures(map)) => map.clone(),
            _ => BTreeMap::new(),
        };

        let stored = checkpoint.map(|c| c.resume.clone()).unwrap_or_default();

        let mut deposits = Vec::new();
        let mut cursors = previous.clone();
        let mut resume = BTreeMap::new();

        for account in &self.accounts {
            let until = previous.get(account).map(String::as_str);
            let anchor = until.and(stored.get(account)).map(|p| p.before.clone());
            let walk = self.signatures_since(account, until, anchor.as_deref()).await?;

            let (batch, anchor) = plan_account(walk, anchor);
            if let Some(before) = anchor {
                resume.insert(account.clone(), ResumePoint { before, ceiling: None });
            }
            let Some(newest) = batch.last().map(|s| s.signature.clone()) else {
                continue;
            };

            let successful: Vec<&SignatureInfo> = batch.iter().filter(|s| s.err.is_none()).collect();
            let pending: Vec<_> = successful
                .into_iter()
                .map(|info| async move {
                    let tx = self.transaction(&info.signature).await?;
                    Ok::<_, ScanError>((info.signature.clone(), tx))
                })
                .collect();
            let txs: Vec<(String, Value)> = stream::iter(pending)
                .buffered(TX_FETCH_CONCURRENCY)
                .try_collect()
                .await?;

            for (signature, tx) in &txs {
                if let Some(deposit) = lamport_deposit(signature, tx, account) {
                    deposits.push(deposit);
                }
            }
            cursors.insert(account.clone(), newest);
        }

        tracing::debug!(accounts = self.accounts.len(), found = deposits.len(), "Scanned Solana signatures");

        Ok(ScanBatch {
            deposits,
            checkpoint: ScanCheckpoint::new(Chain::Sol, Cursor::Signatures(cursors), unix_now())
                .with_resume(resume),
        })
    }
}
