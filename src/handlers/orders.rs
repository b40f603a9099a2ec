use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::order::{self, OrderStatus, PaymentMethod, ShippingAddress};
use crate::entities::order_item;
use crate::errors::ServiceError;
use crate::services::pricing::CartLine;
use crate::{ApiResponse, AppState, ListQuery, PaginatedResponse};

static ORDER_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ORD-[A-Z0-9]{8}$").expect("order number pattern is valid")
});

// Order DTOs

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderRequest {
    #[validate]
    pub shipping_address: ShippingAddress,

    /// Cart lines; prices always come from the catalog, never the client
    #[validate(length(min = 1, message = "Cart must contain at least one item"))]
    pub items: Vec<CartLineRequest>,

    pub coupon_code: Option<String>,

    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CartLineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub tracking_number: String,
    pub user_id: Uuid,
    #[schema(value_type = Object)]
    pub shipping_address: serde_json::Value,
    pub payment_method: PaymentMethod,
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub discount_amount: Decimal,
    pub total_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    pub is_paid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub is_delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentSessionResponse {
    pub provider: PaymentMethod,
    /// Where to send the customer's browser to complete payment
    pub redirect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ref: Option<String>,
}

impl From<&order_item::Model> for OrderItemResponse {
    fn from(model: &order_item::Model) -> Self {
        Self {
            product_id: model.product_id,
            name: model.name.clone(),
            quantity: model.quantity,
            unit_price: model.unit_price,
            image_url: model.image_url.clone(),
        }
    }
}

impl OrderResponse {
    pub fn from_order(order: order::Model) -> Self {
        Self::from_order_with_items(order, &[])
    }

    pub fn from_order_with_items(order: order::Model, items: &[order_item::Model]) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            tracking_number: order.tracking_number,
            user_id: order.user_id,
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            items_price: order.items_price,
            shipping_price: order.shipping_price,
            tax_price: order.tax_price,
            discount_amount: order.discount_amount,
            total_price: order.total_price,
            coupon_code: order.coupon_code,
            is_paid: order.is_paid,
            paid_at: order.paid_at,
            payment_status: order.payment_status,
            transaction_id: order.transaction_id,
            is_delivered: order.is_delivered,
            delivered_at: order.delivered_at,
            status: order.status,
            created_at: order.created_at,
            updated_at: order.updated_at,
            items: items.iter().map(OrderItemResponse::from).collect(),
        }
    }
}

/// Non-owners are told the order does not exist rather than that it is
/// someone else's.
fn ensure_order_access(auth_user: &AuthUser, order: &order::Model) -> Result<(), ServiceError> {
    if auth_user.is_admin() || order.user_id == auth_user.id {
        Ok(())
    } else {
        Err(ServiceError::OrderNotFound(order.id))
    }
}

fn collect_validation_errors(validation_errors: &validator::ValidationErrors) -> Vec<String> {
    validation_errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            let field = field.to_string();
            errors.iter().map(move |error| {
                format!(
                    "{}: {}",
                    field,
                    error.message.as_ref().unwrap_or(&"Invalid value".into())
                )
            })
        })
        .collect()
}

/// Create a new order from a cart
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Price a cart server-side and persist it as an unpaid order",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Unknown products or insufficient stock", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    if let Err(validation_errors) = request.validate() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::validation_errors(collect_validation_errors(
                &validation_errors,
            ))),
        ));
    }

    let lines: Vec<CartLine> = request
        .items
        .iter()
        .map(|item| CartLine {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();

    let placed = state
        .services
        .orders
        .create_order(
            auth_user.id,
            request.shipping_address,
            lines,
            request.coupon_code,
            request.payment_method,
        )
        .await?;

    // A rejected coupon does not fail checkout; the reason rides along as
    // an advisory message.
    let advisory = placed.coupon.rejection.as_ref().map(|r| r.message());
    let response = OrderResponse::from_order_with_items(placed.order, &placed.items);
    let body = match advisory {
        Some(message) => ApiResponse::success_with_message(response, message),
        None => ApiResponse::success(response),
    };

    Ok((StatusCode::CREATED, Json(body)))
}

/// List orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Admins see every order; customers see only their own",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20)"),
    ),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<PaginatedResponse<OrderResponse>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderResponse>>>, ServiceError> {
    let user_filter = if auth_user.is_admin() {
        None
    } else {
        Some(auth_user.id)
    };

    let limit = query.limit.max(1);
    let (orders, total) = state
        .services
        .orders
        .list_orders(user_filter, query.page, limit)
        .await?;

    let total_pages = (total + limit - 1) / limit;
    let items: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from_order).collect();

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page: query.page.max(1),
        limit,
        total_pages,
    })))
}

/// Get a single order with its line items
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let (order, items) = state
        .services
        .orders
        .get_order_with_items(id)
        .await?
        .ok_or(ServiceError::OrderNotFound(id))?;
    ensure_order_access(&auth_user, &order)?;

    Ok(Json(ApiResponse::success(
        OrderResponse::from_order_with_items(order, &items),
    )))
}

/// Look up an order by its human-facing number
#[utoipa::path(
    get,
    path = "/api/v1/orders/by-number/{order_number}",
    summary = "Get order by number",
    params(("order_number" = String, Path, description = "Display number, ORD-XXXXXXXX")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Malformed order number", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order_number = order_number.trim().to_ascii_uppercase();
    if !ORDER_NUMBER_RE.is_match(&order_number) {
        return Err(ServiceError::ValidationError(format!(
            "Malformed order number: {order_number}"
        )));
    }

    let (order, items) = state
        .services
        .orders
        .get_order_by_number(&order_number)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {order_number} not found")))?;
    ensure_order_access(&auth_user, &order)?;

    Ok(Json(ApiResponse::success(
        OrderResponse::from_order_with_items(order, &items),
    )))
}

/// Advance an order's fulfilment status
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    summary = "Update order status",
    description = "Forward-only transitions; delivery and cancellation have dedicated endpoints",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid transition", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;

    let updated = state.services.orders.update_status(id, request.status).await?;
    Ok(Json(ApiResponse::success(OrderResponse::from_order(
        updated,
    ))))
}

/// Confirm delivery of an order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/deliver",
    summary = "Mark order delivered",
    description = "For cash-on-delivery orders this also confirms payment",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order delivered", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Order cannot be delivered", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn deliver_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;

    let delivered = state.services.orders.mark_delivered(id).await?;
    Ok(Json(ApiResponse::success(OrderResponse::from_order(
        delivered,
    ))))
}

/// Cancel an order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    description = "Idempotent; delivered orders cannot be cancelled",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Order cannot be cancelled", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or(ServiceError::OrderNotFound(id))?;
    ensure_order_access(&auth_user, &order)?;

    let cancelled = state.services.orders.cancel_order(id).await?;
    Ok(Json(ApiResponse::success(OrderResponse::from_order(
        cancelled,
    ))))
}

/// Start a hosted payment session for an unpaid order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment-session",
    summary = "Create payment session",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Session created", body = ApiResponse<PaymentSessionResponse>),
        (status = 400, description = "Order cannot be paid online", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Provider rejected the session", body = crate::errors::ErrorResponse),
        (status = 503, description = "Provider not configured", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "Orders"
)]
pub async fn create_payment_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<PaymentSessionResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or(ServiceError::OrderNotFound(id))?;
    ensure_order_access(&auth_user, &order)?;

    if order.status == OrderStatus::Cancelled {
        return Err(ServiceError::InvalidStatus(
            "Cancelled orders cannot be paid".to_string(),
        ));
    }
    if order.is_paid {
        return Err(ServiceError::Conflict(format!(
            "Order {} is already paid",
            order.order_number
        )));
    }
    if order.payment_method == PaymentMethod::Cod {
        return Err(ServiceError::ValidationError(
            "Cash on delivery orders are settled at the door".to_string(),
        ));
    }

    let gateway = state.services.gateways.get(order.payment_method)?;
    let session = gateway.create_session(&order).await?;

    Ok(Json(ApiResponse::success(PaymentSessionResponse {
        provider: order.payment_method,
        redirect_url: session.redirect_url,
        session_ref: session.session_ref,
    })))
}
