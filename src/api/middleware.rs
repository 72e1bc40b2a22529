//! API Middleware - Authentication, Rate Limiting and Headers
//!
//! Provides the security layers of the custody API:
//! - Bearer authentication for admin, cron and webhook routes
//! - Rate limiting per client IP on public routes
//! - Security headers
//! - Response logging with correlation ids

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use super::error::ApiError;
use crate::common::logging::{generate_correlation_id, log_api_response, log_security_event};

// ============================================================================
// Rate Limiting
// ============================================================================

/// Per-IP fixed-window limits
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per client per window
    pub max_requests: u32,
    /// Time window duration
    pub window: Duration,
    /// Extra requests tolerated once the window is full
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            burst: 20,
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    burst_tokens: u32,
}

/// In-memory rate limiter keyed by client id
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Count a request; `Err(retry_after_secs)` when over the limit
    pub async fn check(&self, client_id: &str) -> Result<(), u64> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        // Forget idle clients so the map stays bounded
        let expiry = self.config.window * 2;
        entries.retain(|_, e| now.duration_since(e.window_start) < expiry);

        let entry = entries.entry(client_id.to_string()).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
            burst_tokens: self.config.burst,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
            entry.burst_tokens = self.config.burst.min(entry.burst_tokens + 5);
        }

        if entry.count < self.config.max_requests {
            entry.count += 1;
            Ok(())
        } else if entry.burst_tokens > 0 {
            entry.burst_tokens -= 1;
            entry.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(entry.window_start).as_secs();
            Err(self.config.window.as_secs().saturating_sub(elapsed).max(1))
        }
    }
}

/// Limiter shared by the rate-limited routes
pub type RateLimitState = Arc<RateLimiter>;

pub fn create_rate_limiter() -> RateLimitState {
    Arc::new(RateLimiter::new(RateLimitConfig::default()))
}

/// Extract client IP from proxy headers
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            return Some(value.split(',').next()?.trim().to_string());
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return Some(value.to_string());
        }
    }

    None
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client_id = extract_client_ip(request.headers()).unwrap_or_else(|| "unknown".to_string());

    match limiter.check(&client_id).await {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after) => Err(ApiError::RateLimited { retry_after }),
    }
}

// ============================================================================
// Bearer Authentication
// ============================================================================

/// Compare secrets without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Secret guarding one group of routes
///
/// A guard without a secret rejects every request.
#[derive(Clone)]
pub struct BearerGuard {
    scope: &'static str,
    secret: Option<Arc<str>>,
}

impl BearerGuard {
    pub fn new(scope: &'static str, secret: Option<&str>) -> Self {
        Self {
            scope,
            secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    pub fn allows(&self, headers: &HeaderMap) -> bool {
        match (&self.secret, bearer_token(headers)) {
            (Some(secret), Some(token)) => constant_time_eq(secret.as_bytes(), token.as_bytes()),
            _ => false,
        }
    }
}

pub async fn require_bearer(
    State(guard): State<BearerGuard>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if guard.allows(request.headers()) {
        return Ok(next.run(request).await);
    }

    log_security_event(
        "auth_rejected",
        false,
        serde_json::json!({
            "scope": guard.scope,
            "path": request.uri().path(),
            "client": extract_client_ip(request.headers()),
        }),
        None,
    );
    Err(ApiError::Unauthorized)
}

// ============================================================================
// Headers and Logging
// ============================================================================

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));

    response
}

/// Correlation id echoed back to the caller
pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub async fn request_log_middleware(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(str::to_string)
        .unwrap_or_else(generate_correlation_id);
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert(CORRELATION_HEADER, value);
        log_api_response(
            &method,
            &path,
            response.status().as_u16(),
            started.elapsed().as_millis() as u64,
            &correlation_id,
        );
        return response;
    }

    next.run(request).await
}

/// Correlation id set by `request_log_middleware`
pub fn correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[test]
    fn test_bearer_guard() {
        let guard = BearerGuard::new("admin", Some("s3cret"));
        let mut headers = HeaderMap::new();
        assert!(!guard.allows(&headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!guard.allows(&headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(guard.allows(&headers));

        let disabled = BearerGuard::new("webhook", None);
        assert!(!disabled.allows(&headers));
        let empty = BearerGuard::new("webhook", Some(""));
        assert!(!empty.allows(&headers));
    }

    #[test]
    fn test_client_ip_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), None);

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("10.0.0.2"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_limiter_tracks_clients_separately() {
        let config = RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(1),
            burst: 1,
        };
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("client1").await.is_ok());
        assert!(limiter.check("client1").await.is_ok());
        assert!(limiter.check("client1").await.is_ok());

        // 4th uses burst
        assert!(limiter.check("client1").await.is_ok());

        let retry_after = limiter.check("client1").await.unwrap_err();
        assert!(retry_after >= 1);

        assert!(limiter.check("client2").await.is_ok());
    }
}
