//! Storefront API Library
//!
//! Checkout, order management, and payment reconciliation for a storefront.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod rate_limiter;
pub mod services;

use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
    pub limiter: rate_limiter::RateLimiter,
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrappers
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
        }
    }

    /// Success with an advisory, e.g. "coupon rejected, order placed anyway"
    pub fn success_with_message(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message),
            errors: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Full v1 API surface. The checkout route gets its own rate limit; the
/// provider callback routes are unauthenticated by design.
pub fn api_v1_routes(state: AppState) -> Router<AppState> {
    let checkout = Router::new()
        .route("/orders", post(handlers::orders::create_order))
        .route_layer(middleware::from_fn_with_state(
            state,
            rate_limiter::checkout_rate_limit,
        ));

    let orders = Router::new()
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/by-number/:order_number",
            get(handlers::orders::get_order_by_number),
        )
        .route(
            "/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .route("/orders/:id/deliver", post(handlers::orders::deliver_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route(
            "/orders/:id/payment-session",
            post(handlers::orders::create_payment_session),
        );

    let payments = Router::new()
        .route(
            "/payments/webhook/:provider",
            post(handlers::payments::payment_webhook),
        )
        .route(
            "/payments/callback/:provider",
            get(handlers::payments::payment_callback),
        );

    Router::new()
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        .merge(checkout)
        .merge(orders)
        .merge(payments)
}

async fn api_status() -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    let version = env!("CARGO_PKG_VERSION");
    let git = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    let status_data = json!({
        "status": "ok",
        "version": version,
        "git": git,
        "build_time": build_time,
        "service": "storefront-api",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let health_data = json!({
        "status": db_status,
        "checks": {
            "database": db_status,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(health_data)))
}
