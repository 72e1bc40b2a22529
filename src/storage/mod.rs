//! Storage Layer Module
//!
//! Provides persistence for the custody ledger.
//!
//! This module contains:
//! - The shared SQLite pool created once at startup
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod database;
pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use database::Database;
pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;
pub use traits::{LedgerStore, StorageError, StorageResult};
