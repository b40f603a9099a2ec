use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "ApiKey",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    crate::auth::USER_ID_HEADER,
                    "Authenticated user id; roles ride along in x-user-roles",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront Order & Payment API

Checkout, order management, and payment reconciliation for a storefront.

## Checkout

Carts are priced server-side from the catalog. Submitted prices are never
trusted; coupons are evaluated at checkout and redeemed only once payment
is confirmed.

## Payments

Orders are paid through hosted provider sessions (card, JazzCash,
Easypaisa, Safepay, Stripe) or settled as cash on delivery. Providers
confirm payment through signed webhooks; browser redirects only choose a
landing page.

## Authentication

Requests are authenticated by the upstream gateway, which injects the
`x-user-id` and `x-user-roles` headers. Admin-only endpoints require the
`admin` role.

## Rate Limiting

Order creation is rate limited per client. Check the response headers:
- `x-ratelimit-limit`: Maximum requests per window
- `x-ratelimit-remaining`: Remaining requests in current window
- `x-ratelimit-reset`: Seconds until the window resets
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Checkout and order management endpoints"),
        (name = "Payments", description = "Provider webhook and redirect endpoints"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_by_number,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::deliver_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::create_payment_session,
        crate::handlers::payments::payment_webhook,
        crate::handlers::payments::payment_callback,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,
            crate::PaginatedResponse<serde_json::Value>,
            crate::ListQuery,

            crate::handlers::orders::CreateOrderRequest,
            crate::handlers::orders::CartLineRequest,
            crate::handlers::orders::UpdateStatusRequest,
            crate::handlers::orders::OrderResponse,
            crate::handlers::orders::OrderItemResponse,
            crate::handlers::orders::PaymentSessionResponse,

            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentMethod,
            crate::entities::order::ShippingAddress,

            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
