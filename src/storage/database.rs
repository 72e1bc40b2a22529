//! Shared SQLite Handle
//!
//! One connection pool is opened at startup and handed to every component
//! that persists state (ledger store, encumbrance ledger, custody source).

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use super::traits::StorageError;

/// Pooled SQLite database
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) the database file and run migrations
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    ///
    /// A single connection that is never recycled; every pooled connection to
    /// `:memory:` would otherwise be a separate database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                checkpoint_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scan_status (
                chain TEXT PRIMARY KEY,
                status_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dedup_records (
                dedup_key TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                resolved_user TEXT,
                amounts_json TEXT,
                processed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dedup_expires_at ON dedup_records(expires_at);

            CREATE TABLE IF NOT EXISTS address_index (
                address TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                linked_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                auto_convert INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, asset)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                chain TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                from_address TEXT NOT NULL,
                amounts_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, created_at);

            CREATE TABLE IF NOT EXISTS orphans (
                tx_hash TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                queued_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recent_deposits (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                credited INTEGER NOT NULL DEFAULT 0,
                converted_usd REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS daily_chain_stats (
                date TEXT NOT NULL,
                chain TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, chain)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS encumbrance_state (
                metal TEXT PRIMARY KEY,
                total_allocated_oz REAL NOT NULL DEFAULT 0,
                total_encumbered_oz REAL NOT NULL DEFAULT 0,
                total_pending_oz REAL NOT NULL DEFAULT 0,
                active_lease_count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS encumbrance_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metal TEXT NOT NULL,
                record TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_encumbrance_log_recorded_at ON encumbrance_log(recorded_at);

            CREATE TABLE IF NOT EXISTS custody_stock (
                metal TEXT PRIMARY KEY,
                grams REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}
