//! Encumbrance Types
//!
//! Per-metal counters maintained by the leasing subsystem. The conservation
//! invariant is `allocated = encumbered + pending + available` with
//! `available >= 0`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::units::oz_to_grams;

/// Floating tolerance for ounce arithmetic
pub const OZ_EPSILON: f64 = 1e-9;

/// A stored state breaks the availability invariant
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{metal}: available {available_oz:.6} oz is negative (allocated {allocated_oz:.6}, encumbered {encumbered_oz:.6}, pending {pending_oz:.6})")]
pub struct IntegrityViolation {
    pub metal: String,
    pub allocated_oz: f64,
    pub encumbered_oz: f64,
    pub pending_oz: f64,
    pub available_oz: f64,
}

/// Aggregate encumbrance of one metal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncumbranceState {
    pub metal: String,
    pub total_allocated_oz: f64,
    pub total_encumbered_oz: f64,
    pub total_pending_oz: f64,
    pub active_lease_count: u64,
}

impl EncumbranceState {
    pub fn empty(metal: impl Into<String>) -> Self {
        Self {
            metal: metal.into(),
            total_allocated_oz: 0.0,
            total_encumbered_oz: 0.0,
            total_pending_oz: 0.0,
            active_lease_count: 0,
        }
    }

    /// Unclamped available ounces; negative means a data-integrity problem
    pub fn available_oz(&self) -> f64 {
        self.total_allocated_oz - self.total_encumbered_oz - self.total_pending_oz
    }

    pub fn allocated_grams(&self) -> f64 {
        oz_to_grams(self.total_allocated_oz)
    }

    pub fn is_zero(&self) -> bool {
        self.total_allocated_oz.abs() < OZ_EPSILON
            && self.total_encumbered_oz.abs() < OZ_EPSILON
            && self.total_pending_oz.abs() < OZ_EPSILON
            && self.active_lease_count == 0
    }

    /// Share of allocated metal committed to leases, in percent
    pub fn utilization_pct(&self) -> f64 {
        if self.total_allocated_oz <= OZ_EPSILON {
            return 0.0;
        }
        self.total_encumbered_oz / self.total_allocated_oz * 100.0
    }

    pub fn check_invariant(&self) -> Result<(), IntegrityViolation> {
        let available = self.available_oz();
        let components_valid = self.total_allocated_oz >= -OZ_EPSILON
            && self.total_encumbered_oz >= -OZ_EPSILON
            && self.total_pending_oz >= -OZ_EPSILON;

        if available < -OZ_EPSILON || !components_valid || !available.is_finite() {
            return Err(IntegrityViolation {
                metal: self.metal.clone(),
                allocated_oz: self.total_allocated_oz,
                encumbered_oz: self.total_encumbered_oz,
                pending_oz: self.total_pending_oz,
                available_oz: available,
            });
        }
        Ok(())
    }
}

/// What happened to the encumbrance of a metal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    AllocationAdjusted { delta_oz: f64 },
    PendingReserved { lease_id: String, amount_oz: f64 },
    PendingReleased { lease_id: String, amount_oz: f64 },
    LeaseOpened { lease_id: String, amount_oz: f64 },
    LeaseClosed { lease_id: String, amount_oz: f64 },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::AllocationAdjusted { .. } => "allocation_adjusted",
            LedgerEvent::PendingReserved { .. } => "pending_reserved",
            LedgerEvent::PendingReleased { .. } => "pending_released",
            LedgerEvent::LeaseOpened { .. } => "lease_opened",
            LedgerEvent::LeaseClosed { .. } => "lease_closed",
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerLogEntry {
    pub metal: String,
    pub event: LedgerEvent,
    pub recorded_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(allocated: f64, encumbered: f64, pending: f64) -> EncumbranceState {
        EncumbranceState {
            metal: "AUXG".to_string(),
            total_allocated_oz: allocated,
            total_encumbered_oz: encumbered,
            total_pending_oz: pending,
            active_lease_count: 1,
        }
    }

    #[test]
    fn test_conservation() {
        let s = state(100.0, 40.0, 10.0);
        assert!((s.total_encumbered_oz + s.total_pending_oz + s.available_oz() - s.total_allocated_oz).abs() < OZ_EPSILON);
        assert!(s.check_invariant().is_ok());
        assert!((s.utilization_pct() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_violation_is_reported_not_clamped() {
        let s = state(10.0, 8.0, 5.0);
        let err = s.check_invariant().unwrap_err();
        assert!((err.available_oz + 3.0).abs() < 1e-9);
        assert!(err.to_string().contains("AUXG"));
    }

    #[test]
    fn test_zero_state() {
        assert!(EncumbranceState::empty("AUXS").is_zero());
        assert_eq!(EncumbranceState::empty("AUXS").utilization_pct(), 0.0);
    }
}
