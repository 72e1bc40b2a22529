//! Admin Endpoints (bearer admin token)
//!
//! - GET  /api/admin/scanner/status - Enable flag, run state, per-chain checkpoints
//! - POST /api/admin/scanner/toggle - Enable or disable scheduled scanning
//! - POST /api/admin/scanner/rescan - Clear checkpoints of one or all chains
//! - GET  /api/admin/deposits/recent - Recent credited deposits
//! - GET  /api/admin/orphans - Unmapped deposits awaiting reconcile
//! - POST /api/admin/orphans/reconcile - Credit an orphan to a user
//! - GET  /api/admin/stats/daily - Daily credited totals
//! - POST /api/admin/addresses - Link a sender address to a user
//! - GET  /api/admin/users/:user_id/balance - Balance and latest transactions
//! - GET  /api/admin/reconciliation - Freshly computed reconciliation verdict

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::middleware::correlation_id;
use crate::api::server::SharedState;
use crate::pipeline::ScannerStatus;
use crate::processor::ProcessOutcome;
use crate::reconciliation::ReconciliationSnapshot;
use crate::types::{
    Chain, DailyStats, OrphanDeposit, RecentDeposit, TransactionRecord, UserBalance,
    RECENT_FEED_LIMIT,
};

const MAX_ORPHANS: usize = 500;
const MAX_STATS_DAYS: usize = 90;
const BALANCE_HISTORY: usize = 20;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RescanRequest {
    pub chain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RescanResponse {
    pub chain: Option<Chain>,
    pub cleared: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub tx_hash: String,
    pub user_address: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkAddressRequest {
    pub address: String,
    pub user_id: String,
    pub auto_convert: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LinkAddressResponse {
    pub address: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: UserBalance,
    pub auto_convert: bool,
    pub transactions: Vec<TransactionRecord>,
}

pub async fn handle_scanner_status(State(ctx): State<SharedState>) -> Result<Json<ScannerStatus>, ApiError> {
    Ok(Json(ctx.pipeline.status().await?))
}

pub async fn handle_toggle_scanner(
    State(ctx): State<SharedState>,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let req = body(payload)?;
    ctx.pipeline.set_enabled(req.enabled).await?;
    Ok(Json(ToggleResponse { enabled: req.enabled }))
}

pub async fn handle_rescan(
    State(ctx): State<SharedState>,
    payload: Result<Json<RescanRequest>, JsonRejection>,
) -> Result<Json<RescanResponse>, ApiError> {
    let req = body(payload)?;
    let chain = req
        .chain
        .as_deref()
        .map(str::parse::<Chain>)
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let cleared = ctx.pipeline.rescan(chain).await?;
    Ok(Json(RescanResponse { chain, cleared }))
}

pub async fn handle_recent_deposits(
    State(ctx): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RecentDeposit>>, ApiError> {
    let limit = query.limit.unwrap_or(RECENT_FEED_LIMIT).min(RECENT_FEED_LIMIT);
    Ok(Json(ctx.store.recent_deposits(limit).await?))
}

pub async fn handle_list_orphans(
    State(ctx): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<OrphanDeposit>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(MAX_ORPHANS);
    Ok(Json(ctx.store.list_orphans(limit).await?))
}

/// POST /api/admin/orphans/reconcile
///
/// 409 when the transaction is already credited (including by an earlier
/// reconcile), 404 when no orphan exists for it.
pub async fn handle_reconcile_orphan(
    State(ctx): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Result<Json<ProcessOutcome>, ApiError> {
    let req = body(payload)?;
    let corr = correlation_id(&headers);

    let outcome = ctx
        .processor()
        .reconcile_orphan(&req.tx_hash, &req.user_address, corr.as_deref())
        .await?;
    Ok(Json(outcome))
}

pub async fn handle_daily_stats(
    State(ctx): State<SharedState>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<Vec<DailyStats>>, ApiError> {
    let days = query.days.unwrap_or(7).clamp(1, MAX_STATS_DAYS);
    Ok(Json(ctx.store.daily_stats(days).await?))
}

pub async fn handle_link_address(
    State(ctx): State<SharedState>,
    payload: Result<Json<LinkAddressRequest>, JsonRejection>,
) -> Result<Json<LinkAddressResponse>, ApiError> {
    let req = body(payload)?;
    let address = req.address.trim();
    let user_id = req.user_id.trim();
    if address.is_empty() || user_id.is_empty() {
        return Err(ApiError::validation("address and user_id are required"));
    }

    ctx.store.link_address(address, user_id).await?;
    if let Some(enabled) = req.auto_convert {
        ctx.store.set_auto_convert(user_id, enabled).await?;
    }

    Ok(Json(LinkAddressResponse {
        address: crate::types::normalize_address(address),
        user_id: user_id.to_string(),
    }))
}

pub async fn handle_user_balance(
    State(ctx): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = ctx.store.get_balance(&user_id).await?;
    let auto_convert = ctx.store.get_auto_convert(&user_id).await?.unwrap_or(true);
    let transactions = ctx.store.list_transactions(&user_id, BALANCE_HISTORY).await?;

    Ok(Json(BalanceResponse {
        balance,
        auto_convert,
        transactions,
    }))
}

pub async fn handle_reconciliation(State(ctx): State<SharedState>) -> Json<ReconciliationSnapshot> {
    Json(ctx.reconciliation.refresh().await)
}
