//! Custody Ledger - Multi-chain Deposit Crediting and Metal Reconciliation
//!
//! Server-side services of the custody platform:
//!
//! 1. **Deposit Pipeline** - Scans ETH, BTC, XRP and SOL custody addresses,
//!    credits each deposit exactly once and queues unmapped ones as orphans
//! 2. **Encumbrance Ledger** - Per-metal allocated / encumbered / pending totals
//!    maintained by the leasing subsystem
//! 3. **Reconciliation** - Custody stock versus allocated metal, cached verdict
//! 4. **Transparency** - Public aggregate report
//!
//! Scheduled scans, the deposit webhook and admin reconciliation all go
//! through one `DepositProcessor`, keyed by the canonical transaction hash.

pub mod api;
pub mod common;
pub mod context;
pub mod custody;
pub mod encumbrance;
pub mod pipeline;
pub mod pricing;
pub mod processor;
pub mod reconciliation;
pub mod scanner;
pub mod storage;
pub mod transparency;
pub mod types;

// Re-exports: infrastructure
pub use common::{LedgerConfig, LedgerError, Network, Result};
pub use context::{AppContext, Components};

// Re-exports: deposits
pub use pipeline::{DepositPipeline, PipelineRun, ScannerStatus};
pub use processor::{BonusSchedule, DepositProcessor, ProcessError, ProcessOutcome};
pub use scanner::{ChainScanner, ScanAggregator, ScanError};
pub use storage::{Database, LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StorageError};

// Re-exports: metals
pub use custody::{CustodySnapshot, CustodySource, SqliteCustodySource, StaticCustody};
pub use encumbrance::{EncumbranceError, EncumbranceLedger, MemoryEncumbranceLedger, SqliteEncumbranceLedger};
pub use reconciliation::{ReconciliationEngine, ReconciliationSnapshot, Verdict};
pub use transparency::{TransparencyReport, TransparencyReporter};

pub use types::{Chain, Coin, Deposit};
