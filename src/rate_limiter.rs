//! Fixed-window rate limiting for order creation.
//!
//! Checkout is the one endpoint that creates rows and calls out to payment
//! providers, so it gets a per-client request budget. The store is an
//! in-process [`DashMap`]; counts are per instance, not shared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use crate::auth::USER_ID_HEADER;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::AppState;

/// Expired entries are swept once the map grows past this many keys.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Numeric strings are always valid header values; fall back to "0" for
/// the impossible case.
fn num_to_header_value<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
    pub enable_headers: bool,
}

impl RateLimitConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            requests_per_window: config.checkout_rate_limit_requests,
            window_duration: Duration::from_secs(config.checkout_rate_limit_window_secs.max(1)),
            enable_headers: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 30,
            window_duration: Duration::from_secs(60),
            enable_headers: true,
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Counts one request against `key` and reports whether it fits in the
    /// current window.
    pub fn check(&self, key: &str) -> RateLimitResult {
        if self.entries.len() > MAX_TRACKED_KEYS {
            self.cleanup_expired();
        }

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(RateLimitEntry::new);

        let now = Instant::now();
        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.config.window_duration {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_time = self
            .config
            .window_duration
            .saturating_sub(now.duration_since(entry.window_start));

        if entry.count >= self.config.requests_per_window {
            return RateLimitResult {
                allowed: false,
                limit: self.config.requests_per_window,
                remaining: 0,
                reset_time,
            };
        }

        entry.count += 1;
        RateLimitResult {
            allowed: true,
            limit: self.config.requests_per_window,
            remaining: self.config.requests_per_window - entry.count,
            reset_time,
        }
    }

    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.config.window_duration;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < window);
    }

    fn apply_headers(&self, headers: &mut HeaderMap, result: &RateLimitResult) {
        if !self.config.enable_headers {
            return;
        }
        headers.insert("x-ratelimit-limit", num_to_header_value(result.limit));
        headers.insert(
            "x-ratelimit-remaining",
            num_to_header_value(result.remaining),
        );
        headers.insert(
            "x-ratelimit-reset",
            num_to_header_value(result.reset_time.as_secs()),
        );
    }
}

/// Rate limits by authenticated user when present, else by client IP.
fn client_key(request: &Request) -> String {
    if let Some(user_id) = request.headers().get(USER_ID_HEADER) {
        if let Ok(user_str) = user_id.to_str() {
            return format!("user:{}", user_str.trim());
        }
    }

    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(ip) = forwarded_str.split(',').next() {
                return format!("ip:{}", ip.trim());
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return format!("ip:{}", ip_str.trim());
        }
    }

    "ip:unknown".to_string()
}

/// Middleware applied to the order creation route.
pub async fn checkout_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    let result = state.limiter.check(&key);

    if !result.allowed {
        warn!(key = %key, limit = result.limit, "Checkout rate limit exceeded");
        let mut response = ServiceError::RateLimitExceeded.into_response();
        state.limiter.apply_headers(response.headers_mut(), &result);
        return response;
    }

    let mut response = next.run(request).await;
    state.limiter.apply_headers(response.headers_mut(), &result);
    response
}
