//! USD Pricing
//!
//! Deposits are priced through an oracle. Crediting never waits on the
//! oracle: any failure or nonsensical quote falls back to a static table of
//! last-known prices.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::common::cache::TtlCache;
use crate::types::{Coin, PriceSource};

/// Oracle quotes are reused for one minute
pub const QUOTE_CACHE_TTL: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Price oracle errors
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no quote for {0}")]
    Missing(Coin),

    #[error("invalid quote for {coin}: {price}")]
    Invalid { coin: Coin, price: f64 },
}

/// Source of USD prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, coin: Coin) -> Result<f64, PriceError>;
}

/// Last-known USD prices used when the oracle is unavailable
pub fn fallback_price(coin: Coin) -> f64 {
    match coin {
        Coin::Eth => 3_500.0,
        Coin::Btc => 97_000.0,
        Coin::Xrp => 2.2,
        Coin::Sol => 200.0,
        Coin::Usdt | Coin::Usdc => 1.0,
    }
}

/// CoinGecko asset id of a coin
pub fn coingecko_id(coin: Coin) -> &'static str {
    match coin {
        Coin::Eth => "ethereum",
        Coin::Btc => "bitcoin",
        Coin::Xrp => "ripple",
        Coin::Sol => "solana",
        Coin::Usdt => "tether",
        Coin::Usdc => "usd-coin",
    }
}

/// `simple/price` client for a CoinGecko-compatible API
///
/// One request prices every supported coin; the result is cached briefly so
/// a scan run with many deposits issues a single call.
pub struct CoinGeckoOracle {
    client: Client,
    base_url: String,
    quotes: TtlCache<HashMap<String, HashMap<String, f64>>>,
}

impl CoinGeckoOracle {
    pub fn new(base_url: &str) -> Result<Self, PriceError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            quotes: TtlCache::new(QUOTE_CACHE_TTL),
        })
    }

    async fn fetch_quotes(&self) -> Result<HashMap<String, HashMap<String, f64>>, PriceError> {
        if let Some(quotes) = self.quotes.get().await {
            return Ok(quotes);
        }

        let ids: Vec<&str> = Coin::ALL.iter().map(|c| coingecko_id(*c)).collect();
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url,
            ids.join(",")
        );

        let quotes: HashMap<String, HashMap<String, f64>> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.quotes.put(quotes.clone()).await;
        Ok(quotes)
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoOracle {
    async fn usd_price(&self, coin: Coin) -> Result<f64, PriceError> {
        let quotes = self.fetch_quotes().await?;
        quotes
            .get(coingecko_id(coin))
            .and_then(|q| q.get("usd"))
            .copied()
            .ok_or(PriceError::Missing(coin))
    }
}

/// A USD price and where it came from
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub price_usd: f64,
    pub source: PriceSource,
}

/// Oracle with fallback
#[derive(Clone)]
pub struct PriceBook {
    oracle: Arc<dyn PriceOracle>,
}

impl PriceBook {
    pub fn new(oracle: Arc<dyn PriceOracle>) -> Self {
        Self { oracle }
    }

    /// Price `coin`, degrading to the static table on any oracle problem
    pub async fn quote(&self, coin: Coin) -> Quote {
        let result = self.oracle.usd_price(coin).await.and_then(|price| {
            if price.is_finite() && price > 0.0 {
                Ok(price)
            } else {
                Err(PriceError::Invalid { coin, price })
            }
        });

        match result {
            Ok(price_usd) => Quote {
                price_usd,
                source: PriceSource::Oracle,
            },
            Err(e) => {
                tracing::warn!(coin = %coin, error = %e, "Price oracle unavailable, using fallback");
                Quote {
                    price_usd: fallback_price(coin),
                    source: PriceSource::Fallback,
                }
            }
        }
    }
}

/// Oracle that always answers from the fallback table (offline use)
pub struct StaticOracle;

#[async_trait]
impl PriceOracle for StaticOracle {
    async fn usd_price(&self, coin: Coin) -> Result<f64, PriceError> {
        Ok(fallback_price(coin))
    }
}
