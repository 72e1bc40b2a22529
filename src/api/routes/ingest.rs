//! Ingestion Endpoints
//!
//! - POST /api/cron/deposit-scan - One pipeline run, triggered by the scheduler
//! - POST /api/webhooks/deposit - Submit one observed deposit
//!
//! Both feed the same `DepositProcessor` as the admin reconcile path.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};

use crate::api::error::ApiError;
use crate::api::middleware::correlation_id;
use crate::api::server::SharedState;
use crate::pipeline::PipelineRun;
use crate::processor::{ProcessError, ProcessOutcome};
use crate::types::Deposit;

/// POST /api/cron/deposit-scan
///
/// Returns `{ "enabled": false, ... }` without scanning while the scanner is
/// switched off; an overlapping run reports `skipped`.
pub async fn handle_deposit_scan(State(ctx): State<SharedState>) -> Result<Json<PipelineRun>, ApiError> {
    Ok(Json(ctx.pipeline.run_once().await?))
}

/// POST /api/webhooks/deposit
///
/// The receiving address must be a configured custody address of the
/// deposit's chain; the processor rejects coins the chain cannot carry.
pub async fn handle_deposit_webhook(
    State(ctx): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<Deposit>, JsonRejection>,
) -> Result<Json<ProcessOutcome>, ApiError> {
    let Json(deposit) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    if !ctx.config.is_custody_address(deposit.chain, &deposit.to_address) {
        return Err(ProcessError::Invalid(format!(
            "{} is not a {} custody address",
            deposit.to_address.trim(),
            deposit.chain
        ))
        .into());
    }
    let corr = correlation_id(&headers);

    let outcome = ctx.processor().process(&deposit, corr.as_deref()).await?;
    Ok(Json(outcome))
}
