//! Encumbrance Ledger
//!
//! Per-metal allocated / encumbered / pending counters and the append-only
//! log of changes to them. The leasing subsystem owns the mutations; this
//! crate reads the aggregates for reconciliation and transparency.
//!
//! Lease lifecycle as seen by the counters:
//!
//! ```text
//! reserve (available → pending) → activate (pending → encumbered) → close (encumbered → available)
//!                               ↘ release  (pending → available)
//! ```

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::storage::StorageError;
use crate::types::encumbrance::OZ_EPSILON;
use crate::types::{EncumbranceState, IntegrityViolation, LedgerEvent, LedgerLogEntry};

pub use memory::MemoryEncumbranceLedger;
pub use sqlite::SqliteEncumbranceLedger;

/// Most log entries returned by one read
pub const MAX_LOG_ENTRIES: usize = 500;

/// Encumbrance errors
#[derive(Debug, Error)]
pub enum EncumbranceError {
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("{metal}: requested {requested_oz} oz but only {held_oz} oz {bucket}")]
    Insufficient {
        metal: String,
        bucket: &'static str,
        requested_oz: f64,
        held_oz: f64,
    },

    #[error("{metal}: no active lease to close")]
    NoActiveLease { metal: String },

    #[error("invalid metal code: '{0}'")]
    InvalidMetal(String),

    #[error("change rejected: {0}")]
    Violation(#[from] IntegrityViolation),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Read side of the encumbrance ledger
#[async_trait]
pub trait EncumbranceLedger: Send + Sync {
    /// Current state of every metal with recorded activity
    async fn platform_summary(&self) -> Result<BTreeMap<String, EncumbranceState>, EncumbranceError>;

    /// Newest first, at most `limit` (capped at `MAX_LOG_ENTRIES`)
    async fn ledger_log(&self, limit: usize) -> Result<Vec<LedgerLogEntry>, EncumbranceError>;

    /// Total number of log entries ever recorded
    async fn log_count(&self) -> Result<u64, EncumbranceError>;

    /// Apply a leasing-side change to `metal` (case-insensitive); refused if
    /// it would break the invariant
    async fn apply(&self, metal: &str, event: LedgerEvent) -> Result<EncumbranceState, EncumbranceError>;
}

/// Canonical metal code: trimmed, upper-case
pub fn metal_key(metal: &str) -> Result<String, EncumbranceError> {
    let key = metal.trim().to_uppercase();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EncumbranceError::InvalidMetal(metal.to_string()));
    }
    Ok(key)
}

fn positive(amount: f64) -> Result<f64, EncumbranceError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(amount)
    } else {
        Err(EncumbranceError::InvalidAmount(amount))
    }
}

fn require(metal: &str, bucket: &'static str, requested_oz: f64, held_oz: f64) -> Result<(), EncumbranceError> {
    if requested_oz > held_oz + OZ_EPSILON {
        return Err(EncumbranceError::Insufficient {
            metal: metal.to_string(),
            bucket,
            requested_oz,
            held_oz,
        });
    }
    Ok(())
}

/// Whether `next` is no further from the invariant than `prev`
fn no_worse(prev: &EncumbranceState, next: &EncumbranceState) -> bool {
    let components = [
        (prev.total_allocated_oz, next.total_allocated_oz),
        (prev.total_encumbered_oz, next.total_encumbered_oz),
        (prev.total_pending_oz, next.total_pending_oz),
    ];
    next.available_oz() >= prev.available_oz() - OZ_EPSILON
        && components
            .iter()
            .all(|(before, after)| *after >= -OZ_EPSILON || *after >= *before - OZ_EPSILON)
}

/// Next state after `event`, or why it is refused
///
/// A state that already violates the invariant only accepts changes that do
/// not make it worse, so releases and closes can repair it; the violation
/// itself stays visible to readers until then.
pub fn apply_event(state: &EncumbranceState, event: &LedgerEvent) -> Result<EncumbranceState, EncumbranceError> {
    let metal = state.metal.as_str();
    let mut next = state.clone();

    match event {
        LedgerEvent::AllocationAdjusted { delta_oz } => {
            if !delta_oz.is_finite() || *delta_oz == 0.0 {
                return Err(EncumbranceError::InvalidAmount(*delta_oz));
            }
            if *delta_oz < 0.0 {
                require(metal, "available", -delta_oz, state.available_oz())?;
            }
            next.total_allocated_oz += delta_oz;
        }
        LedgerEvent::PendingReserved { amount_oz, .. } => {
            let amount = positive(*amount_oz)?;
            require(metal, "available", amount, state.available_oz())?;
            next.total_pending_oz += amount;
        }
        LedgerEvent::PendingReleased { amount_oz, .. } => {
            let amount = positive(*amount_oz)?;
            require(metal, "pending", amount, state.total_pending_oz)?;
            next.total_pending_oz -= amount;
        }
        LedgerEvent::LeaseOpened { amount_oz, .. } => {
            let amount = positive(*amount_oz)?;
            require(metal, "pending", amount, state.total_pending_oz)?;
            next.total_pending_oz -= amount;
            next.total_encumbered_oz += amount;
            next.active_lease_count += 1;
        }
        LedgerEvent::LeaseClosed { amount_oz, .. } => {
            let amount = positive(*amount_oz)?;
            if state.active_lease_count == 0 {
                return Err(EncumbranceError::NoActiveLease {
                    metal: metal.to_string(),
                });
            }
            require(metal, "encumbered", amount, state.total_encumbered_oz)?;
            next.total_encumbered_oz -= amount;
            next.active_lease_count -= 1;
        }
    }

    // Absorb float dust so exact round trips land on zero
    for value in [
        &mut next.total_allocated_oz,
        &mut next.total_encumbered_oz,
        &mut next.total_pending_oz,
    ] {
        if value.abs() < OZ_EPSILON {
            *value = 0.0;
        }
    }

    if let Err(violation) = next.check_invariant() {
        if state.check_invariant().is_ok() || !no_worse(state, &next) {
            return Err(violation.into());
        }
    }
    Ok(next)
}
