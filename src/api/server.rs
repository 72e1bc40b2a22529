//! API Server Module
//!
//! Builds the Axum router over the shared `AppContext` and runs it until the
//! shutdown signal fires.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::middleware::{
    create_rate_limiter, rate_limit_middleware, request_log_middleware, require_bearer,
    security_headers_middleware, BearerGuard, RateLimitState,
};
use super::routes::{admin, health, ingest, transparency};
use crate::common::logging::log_system_event;
use crate::context::AppContext;

/// Shared application state type
pub type SharedState = Arc<AppContext>;

pub fn create_router(ctx: SharedState) -> Router {
    create_router_with_limiter(ctx, create_rate_limiter())
}

pub fn create_router_with_limiter(ctx: SharedState, limiter: RateLimitState) -> Router {
    let auth = &ctx.config.auth;
    let admin_guard = BearerGuard::new("admin", Some(auth.admin_token.as_str()));
    let cron_guard = BearerGuard::new("cron", auth.cron_secret.as_deref());
    let webhook_guard = BearerGuard::new("webhook", auth.webhook_secret.as_deref());

    let admin = Router::new()
        .route("/api/admin/scanner/status", get(admin::handle_scanner_status))
        .route("/api/admin/scanner/toggle", post(admin::handle_toggle_scanner))
        .route("/api/admin/scanner/rescan", post(admin::handle_rescan))
        .route("/api/admin/deposits/recent", get(admin::handle_recent_deposits))
        .route("/api/admin/orphans", get(admin::handle_list_orphans))
        .route("/api/admin/orphans/reconcile", post(admin::handle_reconcile_orphan))
        .route("/api/admin/stats/daily", get(admin::handle_daily_stats))
        .route("/api/admin/addresses", post(admin::handle_link_address))
        .route("/api/admin/users/:user_id/balance", get(admin::handle_user_balance))
        .route("/api/admin/reconciliation", get(admin::handle_reconciliation))
        .route_layer(from_fn_with_state(admin_guard, require_bearer));

    let cron = Router::new()
        .route("/api/cron/deposit-scan", post(ingest::handle_deposit_scan))
        .route_layer(from_fn_with_state(cron_guard, require_bearer));

    let webhook = Router::new()
        .route("/api/webhooks/deposit", post(ingest::handle_deposit_webhook))
        .route_layer(from_fn_with_state(webhook_guard, require_bearer));

    let public = Router::new()
        .route("/api/transparency", get(transparency::handle_transparency))
        .route_layer(from_fn_with_state(limiter, rate_limit_middleware));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::handle_health))
        .merge(admin)
        .merge(cron)
        .merge(webhook)
        .merge(public)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(request_log_middleware))
        .layer(cors)
        .with_state(ctx)
}

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(ctx: SharedState, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = ctx.config.api_port;
    let app = create_router(ctx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log_system_event("API server listening", serde_json::json!({ "addr": addr.to_string() }));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::middleware::{RateLimitConfig, RateLimiter};
    use crate::context::testing::{context, ADMIN_TOKEN, CRON_SECRET, ETH_CUSTODY, WEBHOOK_SECRET};
    use crate::scanner::stub::StubScanner;
    use crate::scanner::ChainScanner;
    use crate::encumbrance::EncumbranceLedger;
    use crate::storage::LedgerStore;
    use crate::types::{grams_to_oz, Chain, Coin, Deposit, LedgerEvent};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn eth_deposit(hash: &str, sender: &str) -> serde_json::Value {
        serde_json::json!({
            "chain": "ETH",
            "coin": "ETH",
            "tx_hash": hash,
            "from_address": sender,
            "to_address": ETH_CUSTODY,
            "amount": 0.5,
            "observed_at": 1_700_000_000u64,
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (ctx, _, _) = context(Vec::new());
        let response = create_router(Arc::new(ctx))
            .oneshot(get_req("/api/health", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert!(response.headers().contains_key("x-correlation-id"));
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let (ctx, store, _) = context(Vec::new());
        let app = create_router(Arc::new(ctx));

        let response = app
            .clone()
            .oneshot(get_req("/api/admin/scanner/status", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["code"], "UNAUTHORIZED");

        let response = app
            .clone()
            .oneshot(post_req(
                "/api/admin/scanner/toggle",
                Some("not-the-token"),
                serde_json::json!({ "enabled": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.scanner_enabled().await.unwrap());

        let response = app
            .oneshot(post_req(
                "/api/admin/scanner/toggle",
                Some(ADMIN_TOKEN),
                serde_json::json!({ "enabled": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!store.scanner_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_webhook_credit_then_duplicate() {
        let (ctx, store, _) = context(Vec::new());
        let sender = "0x00000000000000000000000000000000000000aa";
        store.link_address(sender, "user-1").await.unwrap();
        let app = create_router(Arc::new(ctx));

        let response = app
            .clone()
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), eth_deposit("0xAB01", sender)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["outcome"], "credited");

        let response = app
            .clone()
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), eth_deposit("0xab01", sender)))
            .await
            .unwrap();
        assert_eq!(json(response).await["outcome"], "duplicate");

        let balance = store.get_balance("user-1").await.unwrap();
        assert!((balance.platform_units() - 1750.0).abs() < 1e-9);

        let response = app
            .oneshot(post_req("/api/webhooks/deposit", Some(CRON_SECRET), eth_deposit("0xab02", sender)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_rejects_malformed_deposit() {
        let (ctx, _, _) = context(Vec::new());
        let app = create_router(Arc::new(ctx));

        let mut body = eth_deposit("0xab03", "0xaa");
        body["unexpected"] = serde_json::json!(true);
        let response = app
            .clone()
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "VALIDATION_ERROR");

        let mut body = eth_deposit("0xab03", "0xaa");
        body["amount"] = serde_json::json!(-1.0);
        let response = app
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "INVALID_DEPOSIT");
    }

    #[tokio::test]
    async fn test_webhook_rejects_foreign_destination_and_coin() {
        let (ctx, store, _) = context(Vec::new());
        let sender = "0x00000000000000000000000000000000000000aa";
        store.link_address(sender, "user-1").await.unwrap();
        let app = create_router(Arc::new(ctx));

        let mut body = eth_deposit("0xab04", sender);
        body["to_address"] = serde_json::json!("not-a-custody-address");
        let response = app
            .clone()
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "INVALID_DEPOSIT");

        let mut body = eth_deposit("0xab05", sender);
        body["to_address"] = serde_json::json!(ETH_CUSTODY.to_uppercase().replace("0X", "0x"));
        body["coin"] = serde_json::json!("SOL");
        let response = app
            .clone()
            .oneshot(post_req("/api/webhooks/deposit", Some(WEBHOOK_SECRET), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "INVALID_DEPOSIT");

        assert_eq!(store.get_balance("user-1").await.unwrap().platform_units(), 0.0);
        assert!(store.get_dedup("0xab04", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_reconcile_flow() {
        let unmapped = Deposit::new(Chain::Eth, Coin::Eth, "0xfeed", "0xstranger", "0xcc", 0.5, 1_700_000_000);
        let scanner: Arc<dyn ChainScanner> = Arc::new(StubScanner::ok(Chain::Eth, vec![unmapped], 10));
        let (ctx, store, _) = context(vec![scanner]);
        let app = create_router(Arc::new(ctx));

        let response = app
            .clone()
            .oneshot(post_req("/api/cron/deposit-scan", Some(CRON_SECRET), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["orphaned"], 1);

        let response = app
            .clone()
            .oneshot(get_req("/api/admin/orphans", Some(ADMIN_TOKEN)))
            .await
            .unwrap();
        assert_eq!(json(response).await.as_array().unwrap().len(), 1);

        let reconcile = serde_json::json!({ "tx_hash": "0xFEED", "user_address": "0x00000000000000000000000000000000000000BB" });
        let response = app
            .clone()
            .oneshot(post_req("/api/admin/orphans/reconcile", Some(ADMIN_TOKEN), reconcile.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["outcome"], "credited");
        assert!(store.list_orphans(10).await.unwrap().is_empty());

        let response = app
            .clone()
            .oneshot(post_req("/api/admin/orphans/reconcile", Some(ADMIN_TOKEN), reconcile))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json(response).await["code"], "ALREADY_CREDITED");

        let missing = serde_json::json!({ "tx_hash": "0xdead", "user_address": "0xuser" });
        let response = app
            .clone()
            .oneshot(post_req("/api/admin/orphans/reconcile", Some(ADMIN_TOKEN), missing))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get_req("/api/admin/users/0x00000000000000000000000000000000000000BB/balance", Some(ADMIN_TOKEN)))
            .await
            .unwrap();
        let balance = json(response).await;
        assert_eq!(balance["transactions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_scanner_skips_cron_run() {
        let (ctx, store, _) = context(Vec::new());
        store.set_scanner_enabled(false).await.unwrap();
        let app = create_router(Arc::new(ctx));

        let response = app
            .oneshot(post_req("/api/cron/deposit-scan", Some(CRON_SECRET), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["enabled"], false);
    }

    #[tokio::test]
    async fn test_rescan_validates_chain() {
        let (ctx, _, _) = context(Vec::new());
        let app = create_router(Arc::new(ctx));

        let response = app
            .clone()
            .oneshot(post_req("/api/admin/scanner/rescan", Some(ADMIN_TOKEN), serde_json::json!({ "chain": "DOGE" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_req("/api/admin/scanner/rescan", Some(ADMIN_TOKEN), serde_json::json!({ "chain": "btc" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["chain"], "BTC");
    }

    #[tokio::test]
    async fn test_public_transparency_is_rate_limited() {
        let (ctx, _, ledger) = context(Vec::new());
        ledger
            .apply("AUXG", LedgerEvent::AllocationAdjusted { delta_oz: grams_to_oz(1000.0) })
            .await
            .unwrap();
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        }));
        let app = create_router_with_limiter(Arc::new(ctx), limiter);

        let request = || {
            Request::builder()
                .uri("/api/transparency")
                .header("x-forwarded-for", "198.51.100.4")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json(response).await;
        assert_eq!(report["reconciliation"]["verdict"], "reconciled");
        assert_eq!(report["custody"]["grams"]["AUXG"], 1000.0);

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
    }
}
