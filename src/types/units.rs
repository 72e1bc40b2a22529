//! Unit Conversion Utilities
//!
//! Base-unit conversions for the supported chains and metal weights.

/// Satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Wei per Ether
pub const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Drops per XRP
pub const DROPS_PER_XRP: u64 = 1_000_000;

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Grams per troy ounce
pub const GRAMS_PER_TROY_OZ: f64 = 31.1035;

/// Seconds between the Unix epoch and the Ripple epoch (2000-01-01)
pub const RIPPLE_EPOCH_OFFSET: u64 = 946_684_800;

pub fn sats_to_btc(sats: u64) -> f64 {
    sats as f64 / SATS_PER_BTC as f64
}

pub fn wei_to_eth(wei: u128) -> f64 {
    wei as f64 / WEI_PER_ETH as f64
}

pub fn drops_to_xrp(drops: u64) -> f64 {
    drops as f64 / DROPS_PER_XRP as f64
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Scale a raw token amount by its decimals
pub fn scale_token_amount(raw: u128, decimals: u32) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

pub fn oz_to_grams(oz: f64) -> f64 {
    oz * GRAMS_PER_TROY_OZ
}

pub fn grams_to_oz(grams: f64) -> f64 {
    grams / GRAMS_PER_TROY_OZ
}

/// Parse a `0x`-prefixed hex quantity as used by EVM JSON-RPC
pub fn parse_hex_quantity(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_unit_conversions() {
        assert_eq!(sats_to_btc(50_000_000), 0.5);
        assert_eq!(wei_to_eth(500_000_000_000_000_000), 0.5);
        assert_eq!(drops_to_xrp(25_000_000), 25.0);
        assert_eq!(lamports_to_sol(1_500_000_000), 1.5);
        assert_eq!(scale_token_amount(2_500_000, 6), 2.5);
    }

    #[test]
    fn test_troy_ounce_round_trip() {
        assert!((oz_to_grams(1.0) - 31.1035).abs() < 1e-12);
        assert!((oz_to_grams(grams_to_oz(1000.0)) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x10"), Some(16));
        assert_eq!(parse_hex_quantity("0x"), Some(0));
        assert_eq!(parse_hex_quantity("0x6f05b59d3b20000"), Some(500_000_000_000_000_000));
        assert_eq!(parse_hex_quantity("0xzz"), None);
    }
}
