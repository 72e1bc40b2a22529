//! GET /api/health

use axum::{extract::State, response::IntoResponse, Json};

use crate::api::server::SharedState;

pub async fn handle_health(State(ctx): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "custody-ledger",
        "version": env!("CARGO_PKG_VERSION"),
        "network": ctx.config.network.to_string(),
    }))
}
