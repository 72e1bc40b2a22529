//! Application Context
//!
//! Builds every long-lived component once at startup from `LedgerConfig` and
//! a single `Database` handle. The HTTP server, the worker loop and the CLI
//! commands all share the same context.

use std::sync::Arc;
use std::time::Duration;

use crate::common::config::LedgerConfig;
use crate::common::error::Result;
use crate::custody::{CustodySource, SqliteCustodySource, StaticCustody};
use crate::encumbrance::{EncumbranceLedger, SqliteEncumbranceLedger};
use crate::pipeline::DepositPipeline;
use crate::pricing::{CoinGeckoOracle, PriceBook, PriceOracle};
use crate::processor::DepositProcessor;
use crate::reconciliation::ReconciliationEngine;
use crate::scanner::{build_scanners, ChainScanner, ScanAggregator};
use crate::storage::{Database, LedgerStore, SqliteLedgerStore};
use crate::transparency::TransparencyReporter;

/// Swappable collaborators of the context
pub struct Components {
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<dyn EncumbranceLedger>,
    pub custody: Arc<dyn CustodySource>,
    pub scanners: Vec<Arc<dyn ChainScanner>>,
    pub oracle: Arc<dyn PriceOracle>,
}

pub struct AppContext {
    pub config: LedgerConfig,
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<dyn EncumbranceLedger>,
    pub pipeline: Arc<DepositPipeline>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub transparency: Arc<TransparencyReporter>,
}

impl AppContext {
    /// Open the configured database and build production components
    pub fn open(config: LedgerConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;

        let custody: Arc<dyn CustodySource> = match &config.custody_stock_grams {
            Some(grams) => Arc::new(StaticCustody::new(grams.clone())),
            None => Arc::new(SqliteCustodySource::new(db.clone())),
        };

        let components = Components {
            store: Arc::new(SqliteLedgerStore::new(db.clone())),
            ledger: Arc::new(SqliteEncumbranceLedger::new(db)),
            custody,
            scanners: build_scanners(&config)?,
            oracle: Arc::new(CoinGeckoOracle::new(&config.price_api)?),
        };

        Ok(Self::assemble(config, components))
    }

    pub fn assemble(config: LedgerConfig, parts: Components) -> Self {
        let aggregator = ScanAggregator::new(
            parts.scanners,
            parts.store.clone(),
            Duration::from_secs(config.scan_timeout_secs),
        );
        let processor = DepositProcessor::new(
            parts.store.clone(),
            PriceBook::new(parts.oracle),
            config.bonus.clone(),
        );
        let pipeline = Arc::new(DepositPipeline::new(parts.store.clone(), aggregator, processor));

        let reconciliation = Arc::new(
            ReconciliationEngine::new(parts.ledger.clone(), parts.custody.clone())
                .with_metals(config.metals.iter().cloned()),
        );
        let transparency = Arc::new(TransparencyReporter::new(
            parts.ledger.clone(),
            parts.custody,
            reconciliation.clone(),
        ));

        Self {
            config,
            store: parts.store,
            ledger: parts.ledger,
            pipeline,
            reconciliation,
            transparency,
        }
    }

    pub fn processor(&self) -> &DepositProcessor {
        self.pipeline.processor()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::reconciliation::Verdict;
    use crate::types::{grams_to_oz, LedgerEvent};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_assembled_context_shares_ledger() {
        let (ctx, _store, ledger) = context(Vec::new());
        ledger
            .apply("AUXG", LedgerEvent::AllocationAdjusted { delta_oz: grams_to_oz(1000.0) })
            .await
            .unwrap();

        assert_eq!(ctx.reconciliation.reconcile().await.verdict, Verdict::Reconciled);
        assert_eq!(ctx.transparency.report().await.encumbrance.metals.len(), 1);
        assert!(ctx.pipeline.status().await.unwrap().chains.is_empty());
    }

    #[test]
    fn test_open_with_static_stock() {
        let mut config = test_config();
        config.db_path = std::env::temp_dir()
            .join(format!("custody-{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        config.custody_stock_grams = Some(BTreeMap::from([("AUXG".to_string(), 1.0)]));
        let ctx = AppContext::open(config).unwrap();
        assert!(ctx.config.custody_stock_grams.is_some());
    }
}
