//! XRP Ledger Scanner
//!
//! Walks `account_tx` for every custody account across validated ledgers.
//! Only successful `Payment`s that delivered native XRP count as deposits.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{ChainScanner, ScanBatch, ScanError};
use crate::common::config::ChainEndpoint;
use crate::types::units::{drops_to_xrp, unix_now, RIPPLE_EPOCH_OFFSET};
use crate::types::{Chain, Coin, Cursor, Deposit, ScanCheckpoint};

/// Validated ledgers scanned when no checkpoint exists (~2 hours)
pub const INITIAL_LOOKBACK_LEDGERS: u64 = 2_000;

/// `account_tx` pages fetched per account per scan
pub const MAX_PAGES_PER_ACCOUNT: usize = 20;

const PAGE_LIMIT: u32 = 200;

/// Transaction body of an `account_tx` entry (API v1 `tx`, v2 `tx_json`)
fn tx_body(entry: &Value) -> Option<&Value> {
    entry.get("tx_json").or_else(|| entry.get("tx"))
}

fn entry_hash(entry: &Value) -> Option<&str> {
    entry
        .get("hash")
        .and_then(Value::as_str)
        .or_else(|| tx_body(entry)?.get("hash")?.as_str())
}

/// Ledger index of an `account_tx` entry
pub fn entry_ledger(entry: &Value) -> Option<u64> {
    entry
        .get("ledger_index")
        .and_then(Value::as_u64)
        .or_else(|| tx_body(entry)?.get("ledger_index")?.as_u64())
}

/// Deposit carried by one `account_tx` entry, if any
pub fn payment_deposit(entry: &Value, account: &str) -> Option<Deposit> {
    if entry.get("validated").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let tx = tx_body(entry)?;
    let meta = entry.get("meta")?;

    if tx.get("TransactionType")?.as_str()? != "Payment" {
        return None;
    }
    if meta.get("TransactionResult")?.as_str()? != "tesSUCCESS" {
        return None;
    }
    if tx.get("Destination")?.as_str()? != account {
        return None;
    }
    let sender = tx.get("Account")?.as_str()?;
    if sender == account {
        return None;
    }

    // Issued-currency amounts are objects; only drop strings are native XRP
    let drops: u64 = meta.get("delivered_amount")?.as_str()?.parse().ok()?;
    if drops == 0 {
        return None;
    }

    let observed_at = tx
        .get("date")
        .and_then(Value::as_u64)
        .map(|d| d + RIPPLE_EPOCH_OFFSET)
        .unwrap_or(0);

    Some(Deposit::new(
        Chain::Xrp,
        Coin::Xrp,
        entry_hash(entry)?,
        sender,
        account,
        drops_to_xrp(drops),
        observed_at,
    ))
}

/// rippled reports failures inside `result`
fn rippled_result(method: &str, raw: Value) -> Result<Value, ScanError> {
    let result = raw
        .get("result")
        .cloned()
        .ok_or_else(|| ScanError::Parse(format!("{}: missing result", method)))?;

    if result.get("status").and_then(Value::as_str) == Some("error") {
        let message = result
            .get("error_message")
            .or_else(|| result.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ScanError::Rpc { code: 0, message });
    }
    Ok(result)
}

/// XRP deposit scanner
pub struct XrpScanner {
    client: Client,
    url: String,
    accounts: Vec<String>,
}

impl XrpScanner {
    pub fn new(client: Client, endpoint: &ChainEndpoint) -> Self {
        Self {
            client,
            url: endpoint.rpc_url.trim_end_matches('/').to_string(),
            accounts: endpoint.custody_addresses.clone(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ScanError> {
        let body = json!({"method": method, "params": [params]});
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ScanError::Transport(format!("{}: HTTP {}", method, resp.status())));
        }
        rippled_result(method, resp.json().await?)
    }

    async fn validated_ledger(&self) -> Result<u64, ScanError> {
        let result = self.call("ledger", json!({"ledger_index": "validated"})).await?;
        result
            .get("ledger_index")
            .and_then(Value::as_u64)
            .or_else(|| {
                result
                    .get("ledger")?
                    .get("ledger_index")?
                    .as_str()?
                    .parse()
                    .ok()
            })
            .ok_or_else(|| ScanError::Parse("validated ledger index".to_string()))
    }

    /// Deposits to `account` in ledgers `[min, max]` and the highest ledger
    /// fully covered
    async fn account_deposits(&self, account: &str, min: u64, max: u64) -> Result<(Vec<Deposit>, u64), ScanError> {
        let mut deposits = Vec::new();
        let mut marker: Option<Value> = None;
        let mut last_ledger = min.saturating_sub(1);

        for _ in 0..MAX_PAGES_PER_ACCOUNT {
            let mut params = json!({
                "account": account,
                "ledger_index_min": min,
                "ledger_index_max": max,
                "forward": true,
                "limit": PAGE_LIMIT,
            });
            if let Some(m) = marker.take() {
                params["marker"] = m;
            }

            let result = self.call("account_tx", params).await?;
            let entries = result
                .get("transactions")
                .and_then(Value::as_array)
                .ok_or_else(|| ScanError::Parse("account_tx transactions".to_string()))?;

            for entry in entries {
                if let Some(ledger) = entry_ledger(entry) {
                    last_ledger = last_ledger.max(ledger);
                }
                if let Some(deposit) = payment_deposit(entry, account) {
                    deposits.push(deposit);
                }
            }

            match result.get("marker") {
                Some(m) if !m.is_null() => marker = Some(m.clone()),
                _ => return Ok((deposits, max)),
            }
        }

        // The newest ledger seen may be partially read; rescan it next time
        tracing::warn!(account, last_ledger, "XRP history truncated at page limit");
        Ok((deposits, last_ledger.saturating_sub(1).max(min.saturating_sub(1))))
    }
}

#[async_trait]
impl ChainScanner for XrpScanner {
    fn chain(&self) -> Chain {
        Chain::Xrp
    }

    async fn scan(&self, checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError> {
        let previous = checkpoint.and_then(|c| c.cursor.height());
        let validated = self.validated_ledger().await?;
        let min = match previous {
            Some(index) => index + 1,
            None => validated.saturating_sub(INITIAL_LOOKBACK_LEDGERS),
        };

        let mut deposits = Vec::new();
        let mut covered = validated;
        if min <= validated {
            for account in &self.accounts {
                let (found, account_covered) = self.account_deposits(account, min, validated).await?;
                deposits.extend(found);
                covered = covered.min(account_covered);
            }
        }

        let cursor = covered.max(previous.unwrap_or(0));
        tracing::debug!(min, validated, cursor, found = deposits.len(), "Scanned XRP ledgers");

        Ok(ScanBatch {
            deposits,
            checkpoint: ScanCheckpoint::new(Chain::Xrp, Cursor::LedgerIndex(cursor), unix_now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUSTODY: &str = "rCustodyAccount111111111111111111";
    const SENDER: &str = "rSenderAccount2222222222222222222";

    fn payment(tx_key: &str, result: &str, delivered: Value, validated: bool) -> Value {
        let mut entry = json!({
            "validated": validated,
            "meta": {"TransactionResult": result, "delivered_amount": delivered},
        });
        entry[tx_key] = json!({
            "TransactionType": "Payment",
            "Account": SENDER,
            "Destination": CUSTODY,
            "hash": "ABCDEF0123",
            "date": 750000000,
            "ledger_index": 90000000
        });
        entry
    }

    #[test]
    fn test_native_payment_accepted() {
        let deposit = payment_deposit(&payment("tx", "tesSUCCESS", json!("25000000"), true), CUSTODY).unwrap();
        assert_eq!(deposit.amount, 25.0);
        assert_eq!(deposit.from_address, SENDER);
        assert_eq!(deposit.tx_hash, "ABCDEF0123");
        assert_eq!(deposit.observed_at, 750_000_000 + RIPPLE_EPOCH_OFFSET);
    }

    #[test]
    fn test_api_v2_shape() {
        let mut entry = payment("tx_json", "tesSUCCESS", json!("1000000"), true);
        entry["hash"] = json!("FEED01");
        let deposit = payment_deposit(&entry, CUSTODY).unwrap();
        assert_eq!(deposit.tx_hash, "FEED01");
        assert_eq!(entry_ledger(&entry), Some(90_000_000));
    }

    #[test]
    fn test_rejected_payments() {
        let failed = payment("tx", "tecPATH_DRY", json!("25000000"), true);
        assert!(payment_deposit(&failed, CUSTODY).is_none());

        let issued = payment(
            "tx",
            "tesSUCCESS",
            json!({"currency": "USD", "issuer": "rIssuer", "value": "10"}),
            true,
        );
        assert!(payment_deposit(&issued, CUSTODY).is_none());

        let unvalidated = payment("tx", "tesSUCCESS", json!("25000000"), false);
        assert!(payment_deposit(&unvalidated, CUSTODY).is_none());

        let outgoing = payment("tx", "tesSUCCESS", json!("25000000"), true);
        assert!(payment_deposit(&outgoing, SENDER).is_none());
    }

    #[test]
    fn test_rippled_error_result() {
        let raw = json!({"result": {"status": "error", "error": "actNotFound", "error_message": "Account not found."}});
        let err = rippled_result("account_tx", raw).unwrap_err();
        assert!(matches!(err, ScanError::Rpc { ref message, .. } if message == "Account not found."));
    }
}
