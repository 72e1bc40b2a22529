//! Bonus Tiers
//!
//! Maps the USD value of a converted deposit to a bonus percentage. Tiers
//! have inclusive lower bounds and percentages never decrease as the bound
//! grows.

use serde::Serialize;
use thiserror::Error;

/// Default schedule: `min_usd:pct` pairs
pub const DEFAULT_BONUS_TIERS: &str = "0:0,100:3,1000:5,5000:7,10000:10";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BonusError {
    #[error("malformed tier '{0}', expected MIN_USD:PCT")]
    Malformed(String),

    #[error("schedule must contain at least one tier")]
    Empty,

    #[error("first tier must start at 0")]
    MissingZeroTier,

    #[error("tier bounds must be strictly increasing")]
    UnorderedBounds,

    #[error("bonus percentages must not decrease")]
    DecreasingPct,

    #[error("bonus percentage out of range: {0}")]
    PctOutOfRange(f64),
}

/// One tier: deposits of at least `min_usd` earn `pct` percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BonusTier {
    pub min_usd: f64,
    pub pct: f64,
}

/// Validated, ordered bonus schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BonusSchedule {
    tiers: Vec<BonusTier>,
}

impl BonusSchedule {
    pub fn new(tiers: Vec<BonusTier>) -> Result<Self, BonusError> {
        let first = tiers.first().ok_or(BonusError::Empty)?;
        if first.min_usd != 0.0 {
            return Err(BonusError::MissingZeroTier);
        }

        for tier in &tiers {
            if !tier.min_usd.is_finite() {
                return Err(BonusError::Malformed(tier.min_usd.to_string()));
            }
            if !tier.pct.is_finite() || !(0.0..=100.0).contains(&tier.pct) {
                return Err(BonusError::PctOutOfRange(tier.pct));
            }
        }
        for pair in tiers.windows(2) {
            if pair[1].min_usd <= pair[0].min_usd {
                return Err(BonusError::UnorderedBounds);
            }
            if pair[1].pct < pair[0].pct {
                return Err(BonusError::DecreasingPct);
            }
        }

        Ok(Self { tiers })
    }

    /// Parse `0:0,100:3,1000:5`
    pub fn parse(raw: &str) -> Result<Self, BonusError> {
        let tiers = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (min, pct) = entry
                    .split_once(':')
                    .ok_or_else(|| BonusError::Malformed(entry.to_string()))?;
                let min_usd: f64 = min
                    .trim()
                    .parse()
                    .map_err(|_| BonusError::Malformed(entry.to_string()))?;
                let pct: f64 = pct
                    .trim()
                    .parse()
                    .map_err(|_| BonusError::Malformed(entry.to_string()))?;
                Ok(BonusTier { min_usd, pct })
            })
            .collect::<Result<Vec<_>, BonusError>>()?;

        Self::new(tiers)
    }

    /// Bonus percentage for a USD amount
    pub fn pct_for(&self, amount_usd: f64) -> f64 {
        self.tiers
            .iter()
            .rev()
            .find(|t| amount_usd >= t.min_usd)
            .map(|t| t.pct)
            .unwrap_or(0.0)
    }

    /// Bonus units for a USD amount
    pub fn bonus_for(&self, amount_usd: f64) -> (f64, f64) {
        let pct = self.pct_for(amount_usd);
        (pct, amount_usd * pct / 100.0)
    }

    pub fn tiers(&self) -> &[BonusTier] {
        &self.tiers
    }
}

impl Default for BonusSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                BonusTier { min_usd: 0.0, pct: 0.0 },
                BonusTier { min_usd: 100.0, pct: 3.0 },
                BonusTier { min_usd: 1_000.0, pct: 5.0 },
                BonusTier { min_usd: 5_000.0, pct: 7.0 },
                BonusTier { min_usd: 10_000.0, pct: 10.0 },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_constant() {
        assert_eq!(BonusSchedule::parse(DEFAULT_BONUS_TIERS).unwrap(), BonusSchedule::default());
    }

    #[test]
    fn test_tier_boundaries() {
        let schedule = BonusSchedule::default();
        assert_eq!(schedule.pct_for(99.99), 0.0);
        assert_eq!(schedule.pct_for(100.00), 3.0);
        assert_eq!(schedule.pct_for(999.99), 3.0);
        assert_eq!(schedule.pct_for(1000.00), 5.0);
        assert_eq!(schedule.pct_for(4999.99), 5.0);
        assert_eq!(schedule.pct_for(5000.00), 7.0);
        assert_eq!(schedule.pct_for(1_000_000.0), 10.0);
    }

    #[test]
    fn test_monotonic_over_range() {
        let schedule = BonusSchedule::default();
        let mut last = 0.0;
        for cents in (0..1_200_000).step_by(997) {
            let pct = schedule.pct_for(cents as f64 / 100.0);
            assert!(pct >= last);
            last = pct;
        }
    }

    #[test]
    fn test_bonus_amount() {
        let (pct, bonus) = BonusSchedule::default().bonus_for(1750.0);
        assert_eq!(pct, 5.0);
        assert_eq!(bonus, 87.5);
    }

    #[test]
    fn test_rejects_bad_schedules() {
        assert_eq!(BonusSchedule::parse(""), Err(BonusError::Empty));
        assert_eq!(BonusSchedule::parse("10:1"), Err(BonusError::MissingZeroTier));
        assert_eq!(BonusSchedule::parse("0:0,100:5,50:6"), Err(BonusError::UnorderedBounds));
        assert_eq!(BonusSchedule::parse("0:5,100:3"), Err(BonusError::DecreasingPct));
        assert!(matches!(BonusSchedule::parse("0:0,abc"), Err(BonusError::Malformed(_))));
        assert_eq!(BonusSchedule::parse("0:150"), Err(BonusError::PctOutOfRange(150.0)));
    }
}
