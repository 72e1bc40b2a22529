//! Chain and Coin Identifiers
//!
//! Supported deposit chains, the coins they carry, and the key normalization
//! shared by every ingestion path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unknown chain or coin symbol
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error("unknown coin: {0}")]
    UnknownCoin(String),
}

/// A blockchain the platform accepts deposits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    Eth,
    Btc,
    Xrp,
    Sol,
}

impl Chain {
    /// All supported chains, in scan order
    pub const ALL: [Chain; 4] = [Chain::Eth, Chain::Btc, Chain::Xrp, Chain::Sol];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Eth => "ETH",
            Chain::Btc => "BTC",
            Chain::Xrp => "XRP",
            Chain::Sol => "SOL",
        }
    }

    /// The native coin of this chain
    pub fn native_coin(&self) -> Coin {
        match self {
            Chain::Eth => Coin::Eth,
            Chain::Btc => Coin::Btc,
            Chain::Xrp => Coin::Xrp,
            Chain::Sol => Coin::Sol,
        }
    }

    /// Whether deposits of `coin` can arrive on this chain
    pub fn carries(&self, coin: Coin) -> bool {
        match self {
            Chain::Eth => matches!(coin, Coin::Eth | Coin::Usdt | Coin::Usdc),
            other => other.native_coin() == coin,
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Chain {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ETH" | "ETHEREUM" => Ok(Chain::Eth),
            "BTC" | "BITCOIN" => Ok(Chain::Btc),
            "XRP" | "RIPPLE" => Ok(Chain::Xrp),
            "SOL" | "SOLANA" => Ok(Chain::Sol),
            _ => Err(SymbolError::UnknownChain(s.to_string())),
        }
    }
}

/// A coin that can be deposited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coin {
    Eth,
    Btc,
    Xrp,
    Sol,
    Usdt,
    Usdc,
}

impl Coin {
    pub const ALL: [Coin; 6] = [
        Coin::Eth,
        Coin::Btc,
        Coin::Xrp,
        Coin::Sol,
        Coin::Usdt,
        Coin::Usdc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Coin::Eth => "ETH",
            Coin::Btc => "BTC",
            Coin::Xrp => "XRP",
            Coin::Sol => "SOL",
            Coin::Usdt => "USDT",
            Coin::Usdc => "USDC",
        }
    }
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Coin {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ETH" => Ok(Coin::Eth),
            "BTC" => Ok(Coin::Btc),
            "XRP" => Ok(Coin::Xrp),
            "SOL" => Ok(Coin::Sol),
            "USDT" => Ok(Coin::Usdt),
            "USDC" => Ok(Coin::Usdc),
            _ => Err(SymbolError::UnknownCoin(s.to_string())),
        }
    }
}

// =============================================================================
// Key Normalization
// =============================================================================

/// Lower-case hex identifiers, keep everything else verbatim.
///
/// Hex transaction hashes and EVM addresses are case-insensitive, base58
/// signatures and addresses are not.
fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if !body.is_empty() && body.chars().all(|c| c.is_ascii_hexdigit()) {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

/// Canonical form of a transaction hash
pub fn normalize_tx_hash(tx_hash: &str) -> String {
    normalize_identifier(tx_hash)
}

/// Canonical form of an on-chain address for the address→user index
pub fn normalize_address(address: &str) -> String {
    normalize_identifier(address)
}
