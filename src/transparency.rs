//! Transparency Reporter
//!
//! Public, aggregates-only view of custody holdings, encumbrance and the
//! reconciliation verdict. Each section carries its own `error` annotation so
//! one failing source never fails the whole report.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::common::cache::{TtlCache, DEFAULT_CACHE_TTL};
use crate::custody::CustodySource;
use crate::encumbrance::EncumbranceLedger;
use crate::reconciliation::{ReconciliationEngine, ReconciliationSnapshot};
use crate::types::{unix_now, EncumbranceState};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CustodySection {
    pub grams: BTreeMap<String, f64>,
    pub as_of: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Encumbrance visibility for one metal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetalVisibility {
    pub metal: String,
    pub allocated_oz: f64,
    pub encumbered_oz: f64,
    pub pending_oz: f64,
    pub available_oz: f64,
    pub allocated_grams: f64,
    pub utilization_pct: f64,
    pub active_leases: u64,
}

impl From<&EncumbranceState> for MetalVisibility {
    fn from(state: &EncumbranceState) -> Self {
        Self {
            metal: state.metal.clone(),
            allocated_oz: state.total_allocated_oz,
            encumbered_oz: state.total_encumbered_oz,
            pending_oz: state.total_pending_oz,
            available_oz: state.available_oz(),
            allocated_grams: state.allocated_grams(),
            utilization_pct: state.utilization_pct(),
            active_leases: state.active_lease_count,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EncumbranceSection {
    pub metals: Vec<MetalVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivitySummary {
    pub log_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransparencyReport {
    pub generated_at: u64,
    pub custody: CustodySection,
    pub encumbrance: EncumbranceSection,
    pub reconciliation: ReconciliationSnapshot,
    pub activity: ActivitySummary,
}

pub struct TransparencyReporter {
    ledger: Arc<dyn EncumbranceLedger>,
    custody: Arc<dyn CustodySource>,
    reconciliation: Arc<ReconciliationEngine>,
    cache: TtlCache<TransparencyReport>,
}

impl TransparencyReporter {
    pub fn new(
        ledger: Arc<dyn EncumbranceLedger>,
        custody: Arc<dyn CustodySource>,
        reconciliation: Arc<ReconciliationEngine>,
    ) -> Self {
        Self::with_ttl(ledger, custody, reconciliation, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(
        ledger: Arc<dyn EncumbranceLedger>,
        custody: Arc<dyn CustodySource>,
        reconciliation: Arc<ReconciliationEngine>,
        ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            custody,
            reconciliation,
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn report(&self) -> TransparencyReport {
        if let Some(report) = self.cache.get().await {
            return report;
        }
        let report = self.build().await;
        self.cache.put(report.clone()).await;
        report
    }

    async fn build(&self) -> TransparencyReport {
        let (custody, encumbrance, reconciliation, activity) = tokio::join!(
            self.custody_section(),
            self.encumbrance_section(),
            self.reconciliation.reconcile(),
            self.activity_summary(),
        );

        TransparencyReport {
            generated_at: unix_now(),
            custody,
            encumbrance,
            reconciliation,
            activity,
        }
    }

    async fn custody_section(&self) -> CustodySection {
        match self.custody.snapshot().await {
            Ok(snapshot) => CustodySection {
                grams: snapshot.grams,
                as_of: snapshot.as_of,
                error: None,
            },
            Err(e) => CustodySection {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    async fn encumbrance_section(&self) -> EncumbranceSection {
        match self.ledger.platform_summary().await {
            Ok(summary) => EncumbranceSection {
                metals: summary.values().map(MetalVisibility::from).collect(),
                error: None,
            },
            Err(e) => EncumbranceSection {
                metals: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn activity_summary(&self) -> ActivitySummary {
        let (count, latest) = tokio::join!(self.ledger.log_count(), self.ledger.ledger_log(1));
        match count.and_then(|count| latest.map(|log| (count, log))) {
            Ok((count, log)) => ActivitySummary {
                log_entries: count,
                last_activity: log.first().map(|e| e.recorded_at),
                last_event: log.first().map(|e| e.event.name().to_string()),
                error: None,
            },
            Err(e) => ActivitySummary {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}
