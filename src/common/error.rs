//! Common Error Types for the Custody Ledger
//!
//! Root error of the crate; every layer error converts into it.

use thiserror::Error;

use crate::encumbrance::EncumbranceError;
use crate::pricing::PriceError;
use crate::processor::ProcessError;
use crate::scanner::ScanError;
use crate::storage::StorageError;

/// Root error type for the custody ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chain scan errors
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// Price oracle errors
    #[error("price error: {0}")]
    Price(#[from] PriceError),

    /// Deposit processing errors
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// Encumbrance ledger errors
    #[error("encumbrance error: {0}")]
    Encumbrance(#[from] EncumbranceError),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Rejected input
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Unexpected failure with no better variant
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the next scheduled run may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Scan(_) | LedgerError::Price(_) | LedgerError::Io(_) => true,
            LedgerError::Storage(e) => e.is_retryable(),
            LedgerError::Process(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Stable code used in API bodies and logs
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Config(_) => "CONFIG_ERROR",
            LedgerError::Logging(_) => "LOGGING_ERROR",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Scan(_) => "SCAN_ERROR",
            LedgerError::Price(_) => "PRICE_ERROR",
            LedgerError::Process(e) => e.error_code(),
            LedgerError::Encumbrance(_) => "ENCUMBRANCE_ERROR",
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
            LedgerError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using LedgerError
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LedgerError::validation("bad chain");
        assert!(err.to_string().contains("bad chain"));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(LedgerError::Scan(ScanError::Transport("timeout".into())).is_retryable());
        assert!(LedgerError::Storage(StorageError::Connection("pool".into())).is_retryable());
        assert!(!LedgerError::validation("invalid input").is_retryable());
        assert!(!LedgerError::Process(ProcessError::AlreadyCredited("0xab".into())).is_retryable());
    }

    #[test]
    fn test_process_codes_pass_through() {
        let err = LedgerError::from(ProcessError::OrphanNotFound("0xab".into()));
        assert_eq!(err.error_code(), "ORPHAN_NOT_FOUND");
    }
}
