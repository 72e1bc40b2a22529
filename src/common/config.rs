//! Environment-based Configuration for the Custody Ledger
//!
//! All secrets (admin token, cron and webhook secrets) come from environment
//! variables. Devnet falls back to development defaults; other networks must
//! set them explicitly.
//!
//! # Environment Variables
//!
//! ## Network and Storage
//! - `CUSTODY_NETWORK` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `CUSTODY_DB_PATH` - SQLite database path (default: "data/custody.db")
//! - `CUSTODY_API_PORT` - REST API port (default: 3001)
//!
//! ## Authentication
//! - `CUSTODY_ADMIN_TOKEN` - Bearer token for the admin API (required outside devnet)
//! - `CUSTODY_CRON_SECRET` - Bearer secret of the scheduled scan trigger
//! - `CUSTODY_WEBHOOK_SECRET` - Bearer secret of the deposit webhook
//!
//! ## Chains
//! - `CUSTODY_{ETH,BTC,XRP,SOL}_RPC` - Data source endpoints
//! - `CUSTODY_{ETH,BTC,XRP,SOL}_ADDRESSES` - Comma-separated custody addresses
//! - `CUSTODY_ETH_TOKENS` - `SYMBOL:contract:decimals` entries, comma-separated
//! - `CUSTODY_ETH_CONFIRMATIONS` / `CUSTODY_BTC_CONFIRMATIONS` - Minimum depth
//! - `CUSTODY_SCAN_TIMEOUT_SECS` - Per-chain scan timeout (default: 25)
//! - `CUSTODY_SCAN_INTERVAL_SECS` - Worker loop interval (default: 60)
//!
//! ## Pricing, Bonus, Metals
//! - `CUSTODY_PRICE_API` - CoinGecko-compatible base URL
//! - `CUSTODY_BONUS_TIERS` - `min_usd:pct` entries, e.g. "0:0,100:3,1000:5"
//! - `CUSTODY_METALS` - Metal symbols tracked by reconciliation
//! - `CUSTODY_STOCK_GRAMS` - Static custody snapshot, e.g. "AUXG:1000,AUXS:5000"
//!
//! ## Logging
//! - `CUSTODY_LOG_LEVEL` - debug, info, warn, error (default: info)
//! - `CUSTODY_LOG_JSON` - "1" forces JSON output (always on for mainnet)

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::processor::bonus::BonusSchedule;
use crate::types::{normalize_address, Chain, Coin};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("invalid {chain} custody address: {address}")]
    InvalidAddress { chain: Chain, address: String },
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "CUSTODY_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    pub fn default_eth_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://ethereum-rpc.publicnode.com",
            Network::Testnet | Network::Devnet => "https://ethereum-sepolia-rpc.publicnode.com",
        }
    }

    /// Esplora base URL
    pub fn default_bitcoin_api(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet | Network::Devnet => "https://blockstream.info/testnet/api",
        }
    }

    pub fn default_xrp_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://s1.ripple.com:51234",
            Network::Testnet | Network::Devnet => "https://s.altnet.rippletest.net:51234",
        }
    }

    /// Solana JSON-RPC URL
    pub fn default_solana_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
        }
    }

    /// Network used to validate BTC custody addresses
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }

    /// Stablecoin contracts watched on Ethereum when none are configured
    fn default_eth_tokens(&self) -> Vec<TokenContract> {
        match self {
            Network::Mainnet => vec![
                TokenContract {
                    coin: Coin::Usdt,
                    contract: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
                    decimals: 6,
                },
                TokenContract {
                    coin: Coin::Usdc,
                    contract: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
                    decimals: 6,
                },
            ],
            Network::Testnet | Network::Devnet => Vec::new(),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Devnet => "devnet",
        };
        write!(f, "{}", s)
    }
}

/// ERC-20 contract watched for `Transfer` events
#[derive(Debug, Clone, PartialEq)]
pub struct TokenContract {
    pub coin: Coin,
    /// Lower-cased contract address
    pub contract: String,
    pub decimals: u32,
}

/// Endpoint and custody addresses of one chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEndpoint {
    pub rpc_url: String,
    pub custody_addresses: Vec<String>,
    /// Minimum confirmation depth (0 for finality-based chains)
    pub confirmations: u64,
}

impl ChainEndpoint {
    pub fn is_enabled(&self) -> bool {
        !self.custody_addresses.is_empty()
    }
}

/// Bearer secrets of the HTTP surfaces
#[derive(Clone)]
pub struct AuthConfig {
    pub admin_token: String,
    pub cron_secret: Option<String>,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("admin_token", &"<redacted>")
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<redacted>"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Runtime configuration of scanners, storage, API and reconciliation
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub network: Network,
    pub db_path: String,
    pub api_port: u16,
    pub auth: AuthConfig,

    pub eth: ChainEndpoint,
    pub eth_tokens: Vec<TokenContract>,
    pub btc: ChainEndpoint,
    pub xrp: ChainEndpoint,
    pub sol: ChainEndpoint,

    /// Per-chain scan timeout
    pub scan_timeout_secs: u64,
    /// Sleep between worker runs
    pub scan_interval_secs: u64,

    pub price_api: String,
    pub bonus: BonusSchedule,

    /// Metal symbols tracked by reconciliation
    pub metals: Vec<String>,
    /// Static custody snapshot in grams, when no custody table is maintained
    pub custody_stock_grams: Option<BTreeMap<String, f64>>,

    pub log_level: String,
    pub log_json: bool,
}

impl LedgerConfig {
    /// Read `CUSTODY_*` variables from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let network: Network = get("CUSTODY_NETWORK")
            .unwrap_or_else(|| "devnet".to_string())
            .parse()?;

        let db_path = get("CUSTODY_DB_PATH").unwrap_or_else(|| "data/custody.db".to_string());
        let api_port = parse_or("CUSTODY_API_PORT", get("CUSTODY_API_PORT"), 3001u16)?;

        let admin_token = get_required_or_devnet_default(
            "CUSTODY_ADMIN_TOKEN",
            get("CUSTODY_ADMIN_TOKEN"),
            "devnet-admin-token",
            network,
        )?;
        let auth = AuthConfig {
            admin_token,
            cron_secret: get("CUSTODY_CRON_SECRET"),
            webhook_secret: get("CUSTODY_WEBHOOK_SECRET"),
        };

        let eth = ChainEndpoint {
            rpc_url: get("CUSTODY_ETH_RPC").unwrap_or_else(|| network.default_eth_rpc().to_string()),
            custody_addresses: parse_addresses(Chain::Eth, get("CUSTODY_ETH_ADDRESSES"), network)?,
            confirmations: parse_or("CUSTODY_ETH_CONFIRMATIONS", get("CUSTODY_ETH_CONFIRMATIONS"), 12u64)?,
        };
        let eth_tokens = match get("CUSTODY_ETH_TOKENS") {
            Some(raw) => parse_token_contracts(&raw)?,
            None => network.default_eth_tokens(),
        };

        let btc = ChainEndpoint {
            rpc_url: get("CUSTODY_BTC_RPC")
                .unwrap_or_else(|| network.default_bitcoin_api().to_string()),
            custody_addresses: parse_addresses(Chain::Btc, get("CUSTODY_BTC_ADDRESSES"), network)?,
            confirmations: parse_or("CUSTODY_BTC_CONFIRMATIONS", get("CUSTODY_BTC_CONFIRMATIONS"), 6u64)?,
        };

        let xrp = ChainEndpoint {
            rpc_url: get("CUSTODY_XRP_RPC").unwrap_or_else(|| network.default_xrp_rpc().to_string()),
            custody_addresses: parse_addresses(Chain::Xrp, get("CUSTODY_XRP_ADDRESSES"), network)?,
            confirmations: 0,
        };

        let sol = ChainEndpoint {
            rpc_url: get("CUSTODY_SOL_RPC")
                .unwrap_or_else(|| network.default_solana_rpc().to_string()),
            custody_addresses: parse_addresses(Chain::Sol, get("CUSTODY_SOL_ADDRESSES"), network)?,
            confirmations: 0,
        };

        let scan_timeout_secs = parse_or("CUSTODY_SCAN_TIMEOUT_SECS", get("CUSTODY_SCAN_TIMEOUT_SECS"), 25u64)?;
        let scan_interval_secs = parse_or("CUSTODY_SCAN_INTERVAL_SECS", get("CUSTODY_SCAN_INTERVAL_SECS"), 60u64)?;
        if scan_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "CUSTODY_SCAN_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let price_api = get("CUSTODY_PRICE_API")
            .unwrap_or_else(|| "https://api.coingecko.com/api/v3".to_string());

        let bonus = match get("CUSTODY_BONUS_TIERS") {
            Some(raw) => BonusSchedule::parse(&raw).map_err(|e| {
                ConfigError::InvalidValue("CUSTODY_BONUS_TIERS".to_string(), e.to_string())
            })?,
            None => BonusSchedule::default(),
        };

        let metals = get("CUSTODY_METALS")
            .map(|raw| {
                raw.split(',')
                    .map(|m| m.trim().to_uppercase())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| {
                ["AUXG", "AUXS", "AUXPT", "AUXPD"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect()
            });

        let custody_stock_grams = get("CUSTODY_STOCK_GRAMS")
            .map(|raw| parse_stock(&raw))
            .transpose()?;

        let log_level = get("CUSTODY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_json = network == Network::Mainnet
            || get("CUSTODY_LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false);

        Ok(Self {
            network,
            db_path,
            api_port,
            auth,
            eth,
            eth_tokens,
            btc,
            xrp,
            sol,
            scan_timeout_secs,
            scan_interval_secs,
            price_api,
            bonus,
            metals,
            custody_stock_grams,
            log_level,
            log_json,
        })
    }

    /// Endpoint settings of a chain
    pub fn chain(&self, chain: Chain) -> &ChainEndpoint {
        match chain {
            Chain::Eth => &self.eth,
            Chain::Btc => &self.btc,
            Chain::Xrp => &self.xrp,
            Chain::Sol => &self.sol,
        }
    }

    /// Whether `address` is one of the configured custody addresses of `chain`
    pub fn is_custody_address(&self, chain: Chain, address: &str) -> bool {
        let address = normalize_address(address);
        self.chain(chain)
            .custody_addresses
            .iter()
            .any(|a| normalize_address(a) == address)
    }

    /// Print the effective configuration with secrets redacted
    pub fn print_summary(&self) {
        println!("=== Custody Ledger Configuration ===");
        println!("Network: {}", self.network);
        println!("Database: {}", self.db_path);
        for chain in Chain::ALL {
            let endpoint = self.chain(chain);
            println!(
                "{}: {} ({} custody addresses)",
                chain,
                endpoint.rpc_url,
                endpoint.custody_addresses.len()
            );
        }
        println!("ETH tokens: {}", self.eth_tokens.len());
        println!("Scan timeout: {}s, interval: {}s", self.scan_timeout_secs, self.scan_interval_secs);
        println!("Price API: {}", self.price_api);
        println!("Metals: {}", self.metals.join(", "));
        println!("Cron trigger: {}", if self.auth.cron_secret.is_some() { "enabled" } else { "disabled" });
        println!("Webhook: {}", if self.auth.webhook_secret.is_some() { "enabled" } else { "disabled" });
        println!("Log Level: {}", self.log_level);
        println!("====================================");
    }
}

/// Get required value, or use default for devnet only
fn get_required_or_devnet_default(
    var_name: &str,
    value: Option<String>,
    devnet_default: &str,
    network: Network,
) -> Result<String, ConfigError> {
    match value {
        Some(value) => Ok(value),
        None => {
            if network == Network::Devnet {
                Ok(devnet_default.to_string())
            } else {
                Err(ConfigError::MissingEnvVar(var_name.to_string()))
            }
        }
    }
}

fn parse_or<T: FromStr>(var_name: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("cannot parse '{}'", raw))
        }),
        None => Ok(default),
    }
}

fn parse_addresses(
    chain: Chain,
    raw: Option<String>,
    network: Network,
) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut addresses = Vec::new();
    for address in raw.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        if !is_valid_custody_address(chain, address, network) {
            return Err(ConfigError::InvalidAddress {
                chain,
                address: address.to_string(),
            });
        }
        let address = if chain == Chain::Eth {
            address.to_lowercase()
        } else {
            address.to_string()
        };
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}

/// Ripple's base58 alphabet
const XRP_ALPHABET: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

/// Check a custody address against the chain's address format
pub fn is_valid_custody_address(chain: Chain, address: &str, network: Network) -> bool {
    match chain {
        Chain::Eth => {
            address.len() == 42
                && (address.starts_with("0x") || address.starts_with("0X"))
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        Chain::Btc => bitcoin::Address::from_str(address)
            .map(|a| a.is_valid_for_network(network.bitcoin_network()))
            .unwrap_or(false),
        Chain::Xrp => {
            address.starts_with('r')
                && (25..=35).contains(&address.len())
                && address.chars().all(|c| XRP_ALPHABET.contains(c))
        }
        Chain::Sol => solana_sdk::pubkey::Pubkey::from_str(address).is_ok(),
    }
}

fn parse_token_contracts(raw: &str) -> Result<Vec<TokenContract>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue("CUSTODY_ETH_TOKENS".to_string(), reason);

    let mut tokens = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid(format!("expected SYMBOL:contract:decimals, got '{}'", entry)));
        }

        let coin: Coin = parts[0].parse().map_err(|e: crate::types::SymbolError| invalid(e.to_string()))?;
        if !matches!(coin, Coin::Usdt | Coin::Usdc) {
            return Err(invalid(format!("{} is not an ERC-20 stablecoin", coin)));
        }
        if !is_valid_custody_address(Chain::Eth, parts[1], Network::Mainnet) {
            return Err(invalid(format!("bad contract address '{}'", parts[1])));
        }
        let decimals: u32 = parts[2]
            .parse()
            .map_err(|_| invalid(format!("bad decimals '{}'", parts[2])))?;

        tokens.push(TokenContract {
            coin,
            contract: parts[1].to_lowercase(),
            decimals,
        });
    }
    Ok(tokens)
}

fn parse_stock(raw: &str) -> Result<BTreeMap<String, f64>, ConfigError> {
    let mut stock = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (metal, grams) = entry.split_once(':').ok_or_else(|| {
            ConfigError::InvalidValue("CUSTODY_STOCK_GRAMS".to_string(), entry.to_string())
        })?;
        let grams: f64 = grams
            .trim()
            .parse()
            .ok()
            .filter(|g: &f64| g.is_finite() && *g >= 0.0)
            .ok_or_else(|| {
                ConfigError::InvalidValue("CUSTODY_STOCK_GRAMS".to_string(), entry.to_string())
            })?;
        stock.insert(metal.trim().to_uppercase(), grams);
    }
    Ok(stock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("devnet".parse::<Network>(), Ok(Network::Devnet)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_devnet_defaults() {
        let config = LedgerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.network, Network::Devnet);
        assert_eq!(config.eth.confirmations, 12);
        assert_eq!(config.btc.confirmations, 6);
        assert_eq!(config.scan_timeout_secs, 25);
        assert_eq!(config.metals.len(), 4);
        assert!(!config.eth.is_enabled());
        assert!(!config.log_json);
    }

    #[test]
    fn test_admin_token_required_outside_devnet() {
        let result = LedgerConfig::from_lookup(lookup(&[("CUSTODY_NETWORK", "mainnet")]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CUSTODY_ADMIN_TOKEN"));

        let config = LedgerConfig::from_lookup(lookup(&[
            ("CUSTODY_NETWORK", "mainnet"),
            ("CUSTODY_ADMIN_TOKEN", "secret"),
        ]))
        .unwrap();
        assert!(config.log_json);
        assert_eq!(config.eth_tokens.len(), 2);
    }

    #[test]
    fn test_custody_address_validation() {
        let ok = LedgerConfig::from_lookup(lookup(&[
            ("CUSTODY_ETH_ADDRESSES", "0x742D35Cc6634C0532925a3b844Bc454e4438f44e"),
            ("CUSTODY_SOL_ADDRESSES", "11111111111111111111111111111111"),
            ("CUSTODY_XRP_ADDRESSES", "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe"),
        ]))
        .unwrap();
        assert_eq!(
            ok.eth.custody_addresses,
            vec!["0x742d35cc6634c0532925a3b844bc454e4438f44e".to_string()]
        );
        assert!(ok.sol.is_enabled());
        assert!(ok.is_custody_address(Chain::Eth, "0x742D35CC6634C0532925A3B844BC454E4438F44E"));
        assert!(!ok.is_custody_address(Chain::Btc, "0x742d35cc6634c0532925a3b844bc454e4438f44e"));
        assert!(!ok.is_custody_address(Chain::Sol, "not-a-custody-address"));

        let bad = LedgerConfig::from_lookup(lookup(&[("CUSTODY_ETH_ADDRESSES", "0x1234")]));
        assert!(matches!(bad, Err(ConfigError::InvalidAddress { chain: Chain::Eth, .. })));

        let bad = LedgerConfig::from_lookup(lookup(&[("CUSTODY_SOL_ADDRESSES", "not-base58!")]));
        assert!(bad.is_err());
    }

    #[test]
    fn test_btc_address_network() {
        let mainnet = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
        assert!(is_valid_custody_address(Chain::Btc, mainnet, Network::Mainnet));
        assert!(!is_valid_custody_address(Chain::Btc, mainnet, Network::Testnet));
        assert!(!is_valid_custody_address(Chain::Btc, "bc1qnotanaddress", Network::Mainnet));
    }

    #[test]
    fn test_token_and_stock_parsing() {
        let tokens =
            parse_token_contracts("USDC:0xA0b86991c6218b36c1d19d4a2e9eb0ce3606eb48:6").unwrap();
        assert_eq!(tokens[0].coin, Coin::Usdc);
        assert_eq!(tokens[0].decimals, 6);
        assert!(parse_token_contracts("ETH:0xA0b86991c6218b36c1d19d4a2e9eb0ce3606eb48:18").is_err());

        let stock = parse_stock("auxg:1000, AUXS:250.5").unwrap();
        assert_eq!(stock.get("AUXG"), Some(&1000.0));
        assert!(parse_stock("AUXG:-1").is_err());
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let result = LedgerConfig::from_lookup(lookup(&[("CUSTODY_API_PORT", "http")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(..))));

        let result = LedgerConfig::from_lookup(lookup(&[("CUSTODY_SCAN_TIMEOUT_SECS", "0")]));
        assert!(result.is_err());
    }
}
