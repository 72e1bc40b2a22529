//! In-memory encumbrance ledger (tests, devnet)

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{apply_event, metal_key, EncumbranceError, EncumbranceLedger, MAX_LOG_ENTRIES};
use crate::types::{unix_now, EncumbranceState, LedgerEvent, LedgerLogEntry};

#[derive(Default)]
struct Books {
    states: BTreeMap<String, EncumbranceState>,
    log: Vec<LedgerLogEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryEncumbranceLedger {
    books: Arc<RwLock<Books>>,
}

impl MemoryEncumbranceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a state verbatim, bypassing validation (tests and imports)
    pub async fn seed(&self, state: EncumbranceState) {
        self.books
            .write()
            .await
            .states
            .insert(state.metal.clone(), state);
    }
}

#[async_trait]
impl EncumbranceLedger for MemoryEncumbranceLedger {
    async fn platform_summary(&self) -> Result<BTreeMap<String, EncumbranceState>, EncumbranceError> {
        Ok(self.books.read().await.states.clone())
    }

    async fn ledger_log(&self, limit: usize) -> Result<Vec<LedgerLogEntry>, EncumbranceError> {
        let books = self.books.read().await;
        Ok(books
            .log
            .iter()
            .rev()
            .take(limit.min(MAX_LOG_ENTRIES))
            .cloned()
            .collect())
    }

    async fn log_count(&self) -> Result<u64, EncumbranceError> {
        Ok(self.books.read().await.log.len() as u64)
    }

    async fn apply(&self, metal: &str, event: LedgerEvent) -> Result<EncumbranceState, EncumbranceError> {
        let metal = metal_key(metal)?;
        let mut books = self.books.write().await;
        let current = books
            .states
            .get(&metal)
            .cloned()
            .unwrap_or_else(|| EncumbranceState::empty(&metal));

        let next = apply_event(&current, &event)?;
        books.states.insert(metal.clone(), next.clone());
        books.log.push(LedgerLogEntry {
            metal,
            event,
            recorded_at: unix_now(),
        });
        Ok(next)
    }
}
