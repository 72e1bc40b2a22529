//! Custody Stock
//!
//! Grams of each metal physically held by the custodian, as reported by the
//! vault feed. Reconciliation compares this against allocated ounces.

use async_trait::async_trait;
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::storage::{Database, StorageError};
use crate::types::unix_now;

/// Point-in-time custody holdings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustodySnapshot {
    pub grams: BTreeMap<String, f64>,
    pub as_of: u64,
}

impl CustodySnapshot {
    pub fn is_empty(&self) -> bool {
        self.grams.is_empty()
    }
}

/// Source of custody stock
#[async_trait]
pub trait CustodySource: Send + Sync {
    async fn snapshot(&self) -> Result<CustodySnapshot, StorageError>;
}

/// Fixed holdings from configuration
#[derive(Debug, Clone)]
pub struct StaticCustody {
    grams: BTreeMap<String, f64>,
}

impl StaticCustody {
    pub fn new(grams: BTreeMap<String, f64>) -> Self {
        Self { grams }
    }
}

#[async_trait]
impl CustodySource for StaticCustody {
    async fn snapshot(&self) -> Result<CustodySnapshot, StorageError> {
        Ok(CustodySnapshot {
            grams: self.grams.clone(),
            as_of: unix_now(),
        })
    }
}

/// Holdings stored in the `custody_stock` table
#[derive(Clone)]
pub struct SqliteCustodySource {
    db: Database,
}

impl SqliteCustodySource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn set_stock(&self, metal: &str, grams: f64) -> Result<(), StorageError> {
        if !grams.is_finite() || grams < 0.0 {
            return Err(StorageError::InvalidData(format!("custody grams {}", grams)));
        }
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO custody_stock (metal, grams, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(metal) DO UPDATE SET grams = excluded.grams, updated_at = excluded.updated_at",
            params![metal.to_uppercase(), grams, unix_now() as i64],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CustodySource for SqliteCustodySource {
    async fn snapshot(&self) -> Result<CustodySnapshot, StorageError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT metal, grams, updated_at FROM custody_stock")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let as_of = rows.iter().map(|r| r.2.max(0) as u64).max().unwrap_or(0);
        Ok(CustodySnapshot {
            grams: rows.into_iter().map(|(metal, grams, _)| (metal, grams)).collect(),
            as_of,
        })
    }
}
