//! Reconciliation Engine
//!
//! Compares custody grams against allocated ounces per metal and caches the
//! verdict. Reconciliation never fails: missing or unreadable data yields a
//! `Pending` verdict with the reason in `notes`.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::common::cache::{TtlCache, DEFAULT_CACHE_TTL};
use crate::common::logging::log_reconciliation_event;
use crate::custody::{CustodySnapshot, CustodySource};
use crate::encumbrance::EncumbranceLedger;
use crate::types::{unix_now, EncumbranceState};

/// Largest tolerated custody/ledger difference per metal
pub const TOLERANCE_GRAMS: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Reconciled,
    Mismatch,
    Pending,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Reconciled => "reconciled",
            Verdict::Mismatch => "mismatch",
            Verdict::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetalComparison {
    pub metal: String,
    pub custody_grams: f64,
    pub ledger_grams: f64,
    pub diff_grams: f64,
}

impl MetalComparison {
    pub fn within_tolerance(&self) -> bool {
        self.diff_grams.abs() <= TOLERANCE_GRAMS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationSnapshot {
    pub verdict: Verdict,
    pub metals: Vec<MetalComparison>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<String>,
    pub integrity_warnings: Vec<String>,
    pub notes: Vec<String>,
    pub computed_at: u64,
}

impl ReconciliationSnapshot {
    fn pending(note: String, integrity_warnings: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Pending,
            metals: Vec::new(),
            mismatch: None,
            integrity_warnings,
            notes: vec![note],
            computed_at: unix_now(),
        }
    }
}

/// Pure comparison of custody holdings against ledger totals
///
/// A non-empty `tracked` set restricts the comparison to those metals.
pub fn compare(
    custody: &CustodySnapshot,
    summary: &BTreeMap<String, EncumbranceState>,
    tracked: &BTreeSet<String>,
) -> ReconciliationSnapshot {
    let is_tracked = |metal: &String| tracked.is_empty() || tracked.contains(metal);
    let summary: BTreeMap<String, EncumbranceState> = summary
        .iter()
        .filter(|(metal, _)| is_tracked(*metal))
        .map(|(metal, state)| (metal.clone(), state.clone()))
        .collect();

    let integrity_warnings: Vec<String> = summary
        .values()
        .filter_map(|s| s.check_invariant().err())
        .map(|v| v.to_string())
        .collect();

    if summary.is_empty() || summary.values().all(EncumbranceState::is_zero) {
        return ReconciliationSnapshot::pending("no encumbrance data".to_string(), integrity_warnings);
    }
    if custody.is_empty() {
        return ReconciliationSnapshot::pending("empty custody snapshot".to_string(), integrity_warnings);
    }

    let metals: BTreeSet<&String> = custody
        .grams
        .keys()
        .filter(|m| is_tracked(*m))
        .chain(summary.keys())
        .collect();
    let comparisons: Vec<MetalComparison> = metals
        .into_iter()
        .map(|metal| {
            let custody_grams = custody.grams.get(metal).copied().unwrap_or(0.0);
            let ledger_grams = summary.get(metal).map(|s| s.allocated_grams()).unwrap_or(0.0);
            MetalComparison {
                metal: metal.clone(),
                custody_grams,
                ledger_grams,
                diff_grams: custody_grams - ledger_grams,
            }
        })
        .collect();

    let mismatches: Vec<String> = comparisons
        .iter()
        .filter(|c| !c.within_tolerance())
        .map(|c| {
            format!(
                "{}: custody {:.2} g vs ledger {:.2} g (diff {:+.2} g)",
                c.metal, c.custody_grams, c.ledger_grams, c.diff_grams
            )
        })
        .collect();

    let (verdict, mismatch) = if mismatches.is_empty() {
        (Verdict::Reconciled, None)
    } else {
        (Verdict::Mismatch, Some(mismatches.join("; ")))
    };

    ReconciliationSnapshot {
        verdict,
        metals: comparisons,
        mismatch,
        integrity_warnings,
        notes: Vec::new(),
        computed_at: unix_now(),
    }
}

pub struct ReconciliationEngine {
    ledger: Arc<dyn EncumbranceLedger>,
    custody: Arc<dyn CustodySource>,
    tracked: BTreeSet<String>,
    cache: TtlCache<ReconciliationSnapshot>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<dyn EncumbranceLedger>, custody: Arc<dyn CustodySource>) -> Self {
        Self::with_ttl(ledger, custody, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ledger: Arc<dyn EncumbranceLedger>, custody: Arc<dyn CustodySource>, ttl: Duration) -> Self {
        Self {
            ledger,
            custody,
            tracked: BTreeSet::new(),
            cache: TtlCache::new(ttl),
        }
    }

    /// Only compare these metal symbols
    pub fn with_metals<I, S>(mut self, metals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracked = metals.into_iter().map(|m| m.into().to_uppercase()).collect();
        self
    }

    /// Cached verdict, recomputed once the TTL has elapsed
    pub async fn reconcile(&self) -> ReconciliationSnapshot {
        if let Some(snapshot) = self.cache.get().await {
            return snapshot;
        }
        self.refresh().await
    }

    /// Recompute and replace the cached verdict
    pub async fn refresh(&self) -> ReconciliationSnapshot {
        let snapshot = self.compute().await;
        self.cache.put(snapshot.clone()).await;
        snapshot
    }

    async fn compute(&self) -> ReconciliationSnapshot {
        let summary = match self.ledger.platform_summary().await {
            Ok(summary) => summary,
            Err(e) => {
                let snapshot = ReconciliationSnapshot::pending(format!("encumbrance unavailable: {}", e), Vec::new());
                self.log(&snapshot);
                return snapshot;
            }
        };

        let snapshot = match self.custody.snapshot().await {
            Ok(custody) => compare(&custody, &summary, &self.tracked),
            Err(e) => {
                let warnings = compare(&CustodySnapshot::default(), &summary, &self.tracked).integrity_warnings;
                ReconciliationSnapshot::pending(format!("custody unavailable: {}", e), warnings)
            }
        };
        self.log(&snapshot);
        snapshot
    }

    fn log(&self, snapshot: &ReconciliationSnapshot) {
        log_reconciliation_event(
            snapshot.verdict.as_str(),
            serde_json::json!({
                "metals": snapshot.metals.len(),
                "mismatch": snapshot.mismatch,
                "integrity_warnings": snapshot.integrity_warnings,
                "notes": snapshot.notes,
            }),
        );
    }
}
