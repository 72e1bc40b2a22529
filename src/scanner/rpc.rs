//! JSON-RPC 2.0 Client
//!
//! Shared by the Ethereum and Solana scanners. rippled speaks a slightly
//! different dialect and has its own call helper in the XRP scanner.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ScanError;

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

/// Minimal JSON-RPC client over HTTP POST
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: Client,
    url: String,
}

impl JsonRpcClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and decode its `result`
    ///
    /// A `null` result decodes into `T` when `T` accepts it (e.g. `Option`).
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ScanError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ScanError::Transport(format!(
                "{} returned HTTP {}",
                method,
                resp.status()
            )));
        }

        let raw: Value = resp.json().await?;
        decode_response(method, raw)
    }
}

/// Decode a JSON-RPC response envelope
pub fn decode_response<T: DeserializeOwned>(method: &str, raw: Value) -> Result<T, ScanError> {
    let envelope: RpcResponse<Value> = serde_json::from_value(raw)
        .map_err(|e| ScanError::Parse(format!("{}: {}", method, e)))?;

    if let Some(err) = envelope.error {
        return Err(ScanError::Rpc {
            code: err.code,
            message: err.message,
        });
    }

    serde_json::from_value(envelope.result.unwrap_or(Value::Null))
        .map_err(|e| ScanError::Parse(format!("{}: {}", method, e)))
}
