//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the custody ledger.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types
//! - A small TTL cache for the public aggregates

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use cache::{TtlCache, DEFAULT_CACHE_TTL};
pub use config::{AuthConfig, ChainEndpoint, ConfigError, LedgerConfig, Network, TokenContract};
pub use error::{LedgerError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_api_response, log_deposit_event,
    log_reconciliation_event, log_scan_event, log_security_event, log_system_event, EventCategory,
    LogEvent, LogLevel, LoggingError,
};
