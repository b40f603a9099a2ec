use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

/// Standard error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Unprocessable Entity",
    "message": "Insufficient stock for Mechanical Keyboard: requested 5, available 2",
    "details": ["Mechanical Keyboard: requested 5, available 2"],
    "timestamp": "2025-01-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    #[schema(example = "Not Found")]
    pub error: String,
    /// Human-readable error description
    #[schema(example = "Order 550e8400-e29b-41d4-a716-446655440000 not found")]
    pub message: String,
    /// Per-line detail for cart-level errors, one entry per offending item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    /// ISO 8601 timestamp when the error occurred
    #[schema(example = "2025-01-09T10:30:00.000Z")]
    pub timestamp: String,
}

fn join_uuids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Unknown or unavailable products in cart: {}", join_uuids(.missing))]
    InvalidProduct { missing: Vec<Uuid> },

    #[error("Insufficient stock for {product}: requested {requested}, available {available}")]
    InsufficientStock {
        product: String,
        requested: i32,
        available: i32,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Payment provider {0} is not configured")]
    GatewayUnconfigured(String),

    #[error("Payment provider {0} returned no usable session")]
    GatewayRejected(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) | Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidInput(_)
            | Self::EmptyCart
            | Self::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            Self::InvalidProduct { .. } | Self::InsufficientStock { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) | Self::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::GatewayUnconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayRejected(_) | Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal and provider-side errors return generic messages to avoid
    /// leaking implementation detail or provider response bodies.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::InvalidSignature(_) => "Invalid signature".to_string(),
            Self::GatewayRejected(_) => {
                "Payment could not be started. Please try again.".to_string()
            }
            Self::ExternalServiceError(_) => "Upstream service error".to_string(),
            Self::RateLimitExceeded => "Rate limit exceeded".to_string(),
            // User-facing errors return the actual message
            _ => self.to_string(),
        }
    }

    /// Per-line detail for cart-level errors so clients can prune exactly
    /// the offending items.
    pub fn details(&self) -> Option<Vec<String>> {
        match self {
            Self::InvalidProduct { missing } => {
                Some(missing.iter().map(ToString::to_string).collect())
            }
            Self::InsufficientStock {
                product,
                requested,
                available,
            } => Some(vec![format!(
                "{}: requested {}, available {}",
                product, requested, available
            )]),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
