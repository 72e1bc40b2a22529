//! GET /api/transparency
//!
//! Public report, served from the reporter's five-minute cache.

use axum::{extract::State, Json};

use crate::api::server::SharedState;
use crate::transparency::TransparencyReport;

pub async fn handle_transparency(State(ctx): State<SharedState>) -> Json<TransparencyReport> {
    Json(ctx.transparency.report().await)
}
