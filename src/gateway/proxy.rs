//! Reverse proxy with retry and per-instance circuit breakers
//!
//! Upstream responses are fully buffered so a 5xx can be retried without
//! exposing partial writes to the client. Request and response bodies are
//! bounded to prevent memory exhaustion.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;
use reqwest::Client;
use tracing::{error, warn};

use crate::config::ResilienceConfig;
use crate::error::{AppError, Result};
use crate::gateway::routes::{build_backend_url, parse_service_from_path, Backend, RouteTable};
use crate::monitor::breaker::CircuitBreaker;

/// Maximum allowed size for incoming request bodies (10 MiB).
const MAX_REQUEST_BODY: usize = 10 << 20;

/// Maximum buffered size for upstream response bodies (10 MiB).
const MAX_RESPONSE_BODY: usize = 10 << 20;

const CIRCUIT_OPEN: &str = "circuit breaker open";

/// The reverse proxy handler state
pub struct Proxy {
    routes: Arc<RouteTable>,
    resilience: ResilienceConfig,
    client: Client,
    breakers: BreakerMap,
}

/// A captured upstream response, inspected before committing to the client.
struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    fn into_response(mut self) -> Response {
        // Hop-by-hop headers don't survive re-buffering; the body length is
        // recomputed by the server.
        self.headers.remove(header::CONNECTION);
        self.headers.remove(header::TRANSFER_ENCODING);
        self.headers.remove(header::CONTENT_LENGTH);

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Proxy {
    pub fn new(routes: Arc<RouteTable>, resilience: ResilienceConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let breakers = BreakerMap::new(
            resilience.breaker_failure_threshold,
            resilience.breaker_break_duration(),
        );

        Ok(Self {
            routes,
            resilience,
            client,
            breakers,
        })
    }

    /// Route an incoming request to a backend with retries.
    pub async fn handle(&self, req: Request) -> Response {
        let prefix = self.routes.prefix();
        let path = req.uri().path().to_string();

        let Some((service_name, remainder)) = parse_service_from_path(&prefix, &path) else {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        };

        let Some(mut backend) = self.routes.lookup(&service_name) else {
            return (
                StatusCode::BAD_GATEWAY,
                format!("service not found: {}", service_name),
            )
                .into_response();
        };

        let method = req.method().clone();
        let raw_query = req.uri().query().map(str::to_string);
        let mut headers = req.headers().clone();
        headers.remove(header::CONNECTION);
        headers.remove(header::HOST);

        let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY).await {
            Ok(b) => b,
            Err(_) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
            }
        };

        let mut last_err: Option<String> = None;
        let mut last_status: Option<StatusCode> = None;
        let mut last_resp: Option<BufferedResponse> = None;

        for attempt in 0..=self.resilience.retry_count {
            if attempt > 0 {
                let delay = self.retry_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = self.resilience.retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    service = %service_name,
                    "retrying upstream request"
                );
                tokio::time::sleep(delay).await;

                // Re-lookup in case the route table changed.
                if let Some(b) = self.routes.lookup(&service_name) {
                    backend = b;
                }
            }

            let breaker = self.breakers.get(&backend.service_id);
            if !breaker.allow() {
                last_err = Some(CIRCUIT_OPEN.to_string());
                last_status = Some(StatusCode::SERVICE_UNAVAILABLE);
                continue;
            }

            match self
                .forward(&method, &headers, &body, &backend, &remainder, raw_query.as_deref())
                .await
            {
                Ok(buffered) if buffered.status.as_u16() < 500 => {
                    breaker.record_success();
                    return buffered.into_response();
                }
                Ok(buffered) => {
                    breaker.record_failure();
                    last_err = None;
                    last_status = Some(buffered.status);
                    last_resp = Some(buffered);
                }
                Err(e) => {
                    breaker.record_failure();
                    last_err = Some(e.to_string());
                }
            }
        }

        // All attempts exhausted; forward the best response we have.
        if let Some(buffered) = last_resp {
            return buffered.into_response();
        }

        if let Some(e) = &last_err {
            error!(service = %service_name, error = %e, "upstream request failed after retries");
        }
        let status = last_status.unwrap_or(StatusCode::BAD_GATEWAY);
        (status, "upstream request failed").into_response()
    }

    async fn forward(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        backend: &Backend,
        remainder: &str,
        raw_query: Option<&str>,
    ) -> Result<BufferedResponse> {
        let url = build_backend_url(&backend.address, remainder, raw_query);

        let response = self
            .client
            .request(method.clone(), &url)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();

        let mut buf: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > MAX_RESPONSE_BODY {
                buf.extend_from_slice(&chunk[..MAX_RESPONSE_BODY - buf.len()]);
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(BufferedResponse {
            status,
            headers,
            body: buf.into(),
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.resilience.retry_base_delay().as_secs_f64();
        let exponential = base
            * self
                .resilience
                .retry_backoff_exponent
                .powi(attempt as i32 - 1);
        let jitter =
            rand::thread_rng().gen::<f64>() * self.resilience.retry_jitter_max().as_secs_f64();
        Duration::from_secs_f64(exponential + jitter)
    }
}

/// Axum fallback handler delegating to the proxy.
pub async fn proxy_handler(State(proxy): State<Arc<Proxy>>, req: Request) -> Response {
    proxy.handle(req).await
}

/// Lazily-populated circuit breakers keyed by backend service ID.
struct BreakerMap {
    threshold: u32,
    duration: Duration,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerMap {
    fn new(threshold: u32, duration: Duration) -> Self {
        Self {
            threshold,
            duration,
            breakers: DashMap::new(),
        }
    }

    fn get(&self, service_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.threshold, self.duration)))
            .clone()
    }
}
