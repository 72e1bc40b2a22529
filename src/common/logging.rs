//! Structured Logging for the Custody Ledger
//!
//! Provides structured logging with:
//! - JSON output for log aggregation services
//! - Correlation IDs tying a scan run to the deposits it produced
//! - Security event logging for the authenticated surfaces
//!
//! # Usage
//!
//! ```rust,ignore
//! use custody_ledger::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! tracing::info!(target: "custody::scan", chain = "ETH", "Scan complete");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Category tag carried by every `LogEvent`
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// HTTP responses
    Api,
    /// Deposit state transitions
    Deposit,
    /// Chain scanner runs
    Scan,
    /// Custody vs encumbrance checks
    Reconciliation,
    /// Rejected bearer tokens and rate limiting
    Security,
    /// Process lifecycle
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// RFC 3339, UTC
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Stable error code plus message
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Event stamped with the current time
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Serialize this event to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log an authentication or throttling decision
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );

    let event = if let Some(id) = correlation_id {
        event.with_correlation_id(id)
    } else {
        event
    };

    if success {
        tracing::info!(target: "custody::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "custody::security", "{}", event.to_json());
    }
}

/// Log a deposit reaching a terminal state
pub fn log_deposit_event(
    outcome: &str,
    chain: &str,
    tx_hash: &str,
    amount: f64,
    correlation_id: Option<&str>,
    error: Option<&str>,
) {
    let level = if error.is_some() { LogLevel::Error } else { LogLevel::Info };
    let mut event = LogEvent::new(level, EventCategory::Deposit, outcome).with_data(
        serde_json::json!({
            "chain": chain,
            "tx_hash": tx_hash,
            "amount": amount,
        }),
    );

    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }
    if let Some(err) = error {
        event = event.with_error("DEPOSIT_ERROR", err);
    }

    match level {
        LogLevel::Error => tracing::error!(target: "custody::deposit", "{}", event.to_json()),
        _ => tracing::info!(target: "custody::deposit", "{}", event.to_json()),
    }
}

/// Log the result of one chain scan
pub fn log_scan_event(
    chain: &str,
    deposits: usize,
    duration_ms: u64,
    correlation_id: &str,
    error: Option<&str>,
) {
    let level = if error.is_some() { LogLevel::Warn } else { LogLevel::Info };
    let mut event = LogEvent::new(level, EventCategory::Scan, format!("{} scan", chain))
        .with_correlation_id(correlation_id)
        .with_duration(duration_ms)
        .with_data(serde_json::json!({
            "chain": chain,
            "deposits": deposits,
        }));

    if let Some(err) = error {
        event = event.with_error("SCAN_ERROR", err);
        tracing::warn!(target: "custody::scan", "{}", event.to_json());
    } else {
        tracing::info!(target: "custody::scan", "{}", event.to_json());
    }
}

/// Log a reconciliation verdict
pub fn log_reconciliation_event(verdict: &str, details: serde_json::Value) {
    let level = if verdict == "mismatch" { LogLevel::Warn } else { LogLevel::Info };
    let event = LogEvent::new(level, EventCategory::Reconciliation, verdict).with_data(details);

    if level == LogLevel::Warn {
        tracing::warn!(target: "custody::reconciliation", "{}", event.to_json());
    } else {
        tracing::info!(target: "custody::reconciliation", "{}", event.to_json());
    }
}

/// Log an API response
pub fn log_api_response(method: &str, path: &str, status: u16, duration_ms: u64, correlation_id: &str) {
    let level = if status >= 500 {
        LogLevel::Error
    } else if status >= 400 {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };

    let event = LogEvent::new(level, EventCategory::Api, format!("{} {} -> {}", method, path, status))
        .with_correlation_id(correlation_id)
        .with_duration(duration_ms)
        .with_data(serde_json::json!({
            "method": method,
            "path": path,
            "status": status
        }));

    match level {
        LogLevel::Error => tracing::error!(target: "custody::api", "{}", event.to_json()),
        LogLevel::Warn => tracing::warn!(target: "custody::api", "{}", event.to_json()),
        _ => tracing::info!(target: "custody::api", "{}", event.to_json()),
    }
}

/// Log a lifecycle event (startup, shutdown)
pub fn log_system_event(message: &str, data: serde_json::Value) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::System, message).with_data(data);
    tracing::info!(target: "custody::system", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// # Arguments
/// * `level` - Default filter when `RUST_LOG` is unset
/// * `json_format` - One JSON object per line instead of pretty output
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_filter();
        EnvFilter::new(format!(
            "custody={},custody_ledger={},tower_http={},axum={}",
            level, level, level, level
        ))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );

        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );

        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from LedgerConfig
pub fn init_from_config(config: &super::config::LedgerConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for a scan run or request
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_event_json_shape() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Scan, "ETH scan")
            .with_correlation_id("run-123")
            .with_data(serde_json::json!({"deposits": 3}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("ETH scan"));
        assert!(json.contains("run-123"));
        assert!(json.contains("\"category\":\"scan\""));
        assert!(json.contains("42"));
    }

    #[test]
    fn test_error_details_serialized() {
        let event = LogEvent::new(LogLevel::Error, EventCategory::Deposit, "failed")
            .with_error("DEPOSIT_ERROR", "pool exhausted");
        let json = event.to_json();
        assert!(json.contains("DEPOSIT_ERROR"));
        assert!(json.contains("\"level\":\"ERROR\""));
    }

    #[test]
    fn test_level_from_env_string() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let id1 = generate_correlation_id();
        let id2 = generate_correlation_id();
        assert_eq!(id1.len(), 32);
        assert_ne!(id1, id2);
    }
}
