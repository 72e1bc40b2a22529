//! API error responses
//!
//! Every failure leaves the server as `{ "error": ..., "code": ... }` with a
//! status derived from the underlying `LedgerError`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::common::error::LedgerError;
use crate::processor::ProcessError;
use crate::storage::StorageError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    RateLimited { retry_after: u64 },
    Ledger(LedgerError),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Ledger(LedgerError::validation(msg))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Ledger(e) => ledger_status(e),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::Ledger(e) => e.error_code(),
        }
    }
}

fn ledger_status(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::Process(ProcessError::AlreadyCredited(_) | ProcessError::InProgress(_)) => {
            StatusCode::CONFLICT
        }
        LedgerError::Process(ProcessError::OrphanNotFound(_))
        | LedgerError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
        LedgerError::Process(ProcessError::Invalid(_)) | LedgerError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::Storage(StorageError::Conflict(_) | StorageError::Duplicate(_)) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError::Ledger(e)
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        ApiError::Ledger(e.into())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Ledger(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::RateLimited { .. } => "Rate limit exceeded".to_string(),
            // Internal details stay in the logs
            ApiError::Ledger(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %e, "Request failed");
                "Internal error".to_string()
            }
            ApiError::Ledger(e) => e.to_string(),
        };
        let body = ErrorBody {
            error,
            code: self.code().to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
