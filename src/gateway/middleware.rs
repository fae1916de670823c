//! Gateway middleware: request logging, CORS, rate limiting, and JWT auth
//!
//! Composition order from outermost to innermost: request logging -> CORS ->
//! rate limit -> JWT -> router.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tower::{Layer, Service};
use tracing::{info, warn};

use crate::config::{CorsConfig, JwtConfig};

type HmacSha256 = Hmac<Sha256>;

/// Middleware error response body
#[derive(Serialize)]
struct MiddlewareError {
    error: MiddlewareErrorDetail,
}

#[derive(Serialize)]
struct MiddlewareErrorDetail {
    message: String,
    r#type: String,
    code: String,
}

fn error_response(status: StatusCode, message: &str, error_type: &str, code: &str) -> Response {
    let body = MiddlewareError {
        error: MiddlewareErrorDetail {
            message: message.to_string(),
            r#type: error_type.to_string(),
            code: code.to_string(),
        },
    };
    (status, Json(body)).into_response()
}

// --- Client IP extraction ---

/// Extract the client IP, trusting `X-Forwarded-For` only from loopback
/// peers (trusted-proxy model).
pub fn client_ip(req: &Request<Body>) -> String {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Some(remote) = remote else {
        return "unknown".to_string();
    };

    if remote.ip().is_loopback() {
        if let Some(xff) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            let first = xff.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    remote.ip().to_string()
}

// --- Request logging ---

/// Structured request/response logging layer
#[derive(Clone, Default)]
pub struct RequestLoggingLayer;

impl RequestLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct RequestLoggingMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLoggingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let start = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let ip = client_ip(&request);
        let correlation_id = request
            .headers()
            .get("x-correlation-id")
            .or_else(|| request.headers().get("x-request-id"))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        info!(
            method = %method,
            path = %path,
            client_ip = %ip,
            correlation_id = %correlation_id,
            "incoming request"
        );

        let future = self.inner.call(request);
        Box::pin(async move {
            let response = future.await?;

            info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                correlation_id = %correlation_id,
                "outgoing response"
            );
            Ok(response)
        })
    }
}

// --- CORS ---

/// Cross-Origin Resource Sharing layer
#[derive(Clone)]
pub struct CorsLayer {
    config: Arc<CorsConfig>,
}

impl CorsLayer {
    pub fn new(config: CorsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsMiddleware {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CorsMiddleware<S> {
    inner: S,
    config: Arc<CorsConfig>,
}

impl<S> CorsMiddleware<S> {
    fn cors_headers(&self, origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(origin) = origin else {
            return headers;
        };

        let allowed = self.config.allow_any_origin
            || self.config.allowed_origins.is_empty()
            || self
                .config
                .allowed_origins
                .iter()
                .any(|o| o.eq_ignore_ascii_case(origin));
        if !allowed {
            return headers;
        }

        if self.config.allow_any_origin {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        } else if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }

        if let Ok(value) = HeaderValue::from_str(&self.config.allowed_methods.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.config.allowed_headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }

        headers
    }
}

impl<S> Service<Request<Body>> for CorsMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let cors_headers = self.cors_headers(origin.as_deref());

        // Preflight requests terminate here regardless of the inner handler.
        if request.method() == Method::OPTIONS {
            return Box::pin(async move {
                let mut response = StatusCode::NO_CONTENT.into_response();
                response.headers_mut().extend(cors_headers);
                Ok(response)
            });
        }

        let future = self.inner.call(request);
        Box::pin(async move {
            let mut response = future.await?;
            response.headers_mut().extend(cors_headers);
            Ok(response)
        })
    }
}

// --- Rate limiting ---

/// Fixed-window rate limiter keyed by client IP.
///
/// The window begins with the first request for a key and ends at
/// `first + window`; expired buckets are replaced in place on the next
/// request for the key.
pub struct FixedWindowLimiter {
    buckets: Mutex<HashMap<String, WindowBucket>>,
    limit: u32,
    window: Duration,
}

struct WindowBucket {
    count: u32,
    reset_at: Instant,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Whether a request for the key is admitted in the current window.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        match buckets.get_mut(key) {
            Some(bucket) if now < bucket.reset_at => {
                if bucket.count >= self.limit {
                    return false;
                }
                bucket.count += 1;
                true
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    WindowBucket {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }
}

/// Per-client-IP rate limiting layer
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<FixedWindowLimiter>,
}

impl RateLimitLayer {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limiter: Arc::new(FixedWindowLimiter::new(limit, window)),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<FixedWindowLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The health endpoint is never rate limited.
        if request.uri().path() == "/health" {
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        let ip = client_ip(&request);
        if !self.limiter.allow(&ip) {
            warn!(client_ip = %ip, "rate limit exceeded");
            return Box::pin(async move {
                Ok(error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many requests. Please try again later.",
                    "rate_limit_error",
                    "rate_limit_exceeded",
                ))
            });
        }

        let future = self.inner.call(request);
        Box::pin(async move { future.await })
    }
}

// --- JWT authentication ---

/// JWT validation failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtError {
    InvalidFormat,
    InvalidSignature,
    Expired,
    InvalidIssuer,
    InvalidAudience,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JwtError::InvalidFormat => "invalid token format",
            JwtError::InvalidSignature => "invalid signature",
            JwtError::Expired => "token expired",
            JwtError::InvalidIssuer => "invalid issuer",
            JwtError::InvalidAudience => "invalid audience",
        };
        f.write_str(s)
    }
}

/// Minimal HS256 JWT validation: signature, expiry, issuer, audience.
pub fn validate_jwt(token: &str, config: &JwtConfig) -> Result<(), JwtError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(JwtError::InvalidFormat);
    }

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let mut mac = HmacSha256::new_from_slice(config.secret_key.as_bytes())
        .map_err(|_| JwtError::InvalidFormat)?;
    mac.update(signing_input.as_bytes());

    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| JwtError::InvalidSignature)?;
    // verify_slice is constant-time.
    mac.verify_slice(&signature)
        .map_err(|_| JwtError::InvalidSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| JwtError::InvalidFormat)?;

    #[derive(Deserialize)]
    struct Claims {
        #[serde(default)]
        exp: i64,
        #[serde(default)]
        iss: String,
        #[serde(default)]
        aud: String,
    }
    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| JwtError::InvalidFormat)?;

    if claims.exp > 0 && Utc::now().timestamp() > claims.exp {
        return Err(JwtError::Expired);
    }
    if config.validate_issuer && !config.issuer.is_empty() && claims.iss != config.issuer {
        return Err(JwtError::InvalidIssuer);
    }
    if config.validate_audience && !config.audience.is_empty() && claims.aud != config.audience {
        return Err(JwtError::InvalidAudience);
    }

    Ok(())
}

/// JWT bearer token authentication layer with a path skip-list.
#[derive(Clone)]
pub struct JwtAuthLayer {
    config: Arc<JwtConfig>,
    skip_paths: Arc<Vec<String>>,
}

impl JwtAuthLayer {
    pub fn new(config: JwtConfig, skip_paths: Vec<String>) -> Self {
        Self {
            config: Arc::new(config),
            skip_paths: Arc::new(skip_paths),
        }
    }
}

impl<S> Layer<S> for JwtAuthLayer {
    type Service = JwtAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtAuthMiddleware {
            inner,
            config: self.config.clone(),
            skip_paths: self.skip_paths.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JwtAuthMiddleware<S> {
    inner: S,
    config: Arc<JwtConfig>,
    skip_paths: Arc<Vec<String>>,
}

impl<S> Service<Request<Body>> for JwtAuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let path = request.uri().path();
        let skipped = self.skip_paths.iter().any(|p| path.starts_with(p.as_str()));

        // No secret configured = auth disabled.
        if skipped || self.config.secret_key.is_empty() {
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        let token = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Box::pin(async move {
                Ok(error_response(
                    StatusCode::UNAUTHORIZED,
                    "missing or invalid authorization header",
                    "authentication_error",
                    "missing_token",
                ))
            });
        };

        if let Err(e) = validate_jwt(token, &self.config) {
            warn!(path = %path, error = %e, "rejected token");
            return Box::pin(async move {
                Ok(error_response(
                    StatusCode::UNAUTHORIZED,
                    &format!("invalid token: {}", e),
                    "authentication_error",
                    "invalid_token",
                ))
            });
        }

        let future = self.inner.call(request);
        Box::pin(async move { future.await })
    }
}
