//! Provider-facing callback endpoints.
//!
//! Both endpoints accept whatever the provider sends and let the
//! reconciler decide what it means. Webhooks answer JSON; redirects
//! answer with a browser redirect to the storefront landing page.

use std::collections::HashMap;
use std::str::FromStr;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::PaymentMethod;
use crate::errors::ServiceError;
use crate::AppState;

fn parse_provider(raw: &str) -> Result<PaymentMethod, ServiceError> {
    PaymentMethod::from_str(raw.trim().to_ascii_lowercase().as_str())
        .map_err(|_| ServiceError::NotFound(format!("Unknown payment provider: {raw}")))
}

fn success_landing(frontend_base_url: &str, order_id: Uuid) -> String {
    format!(
        "{}/payment/success/{}",
        frontend_base_url.trim_end_matches('/'),
        order_id
    )
}

fn failed_landing(frontend_base_url: &str, order_id: Option<Uuid>) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    match order_id {
        Some(id) => format!("{base}/payment/failed/{id}"),
        None => format!("{base}/payment/failed"),
    }
}

/// Server-to-server payment notification
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook/{provider}",
    summary = "Payment webhook",
    description = "Signature-verified provider notification; always acknowledged once processed",
    params(("provider" = String, Path, description = "Payment provider name")),
    request_body = String,
    responses(
        (status = 200, description = "Webhook processed", body = Object),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Signature verification failed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown provider", body = crate::errors::ErrorResponse),
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let provider = parse_provider(&provider)?;

    let outcome = state
        .services
        .reconciliation
        .process_webhook(provider, &headers, &body)
        .await?;

    info!(provider = %provider, outcome = ?outcome, "Payment webhook processed");

    // Acknowledge every verified webhook, including replays and unknown
    // orders, so providers stop retrying.
    Ok(Json(json!({ "received": true })))
}

/// Browser return from a hosted payment page
#[utoipa::path(
    get,
    path = "/api/v1/payments/callback/{provider}",
    summary = "Payment redirect callback",
    description = "Reconciles the redirect parameters and forwards the browser to the storefront",
    params(("provider" = String, Path, description = "Payment provider name")),
    responses(
        (status = 303, description = "Redirect to the storefront landing page"),
    ),
    tag = "Payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Redirect {
    let frontend = &state.config.frontend_base_url;

    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(_) => {
            warn!(provider = %provider, "Redirect callback for unknown provider");
            return Redirect::to(&failed_landing(frontend, None));
        }
    };

    match state
        .services
        .reconciliation
        .process_redirect(provider, &params)
        .await
    {
        Ok((outcome, order_id)) => {
            info!(provider = %provider, order_id = %order_id, outcome = ?outcome, "Redirect callback processed");
            if outcome.is_success() {
                Redirect::to(&success_landing(frontend, order_id))
            } else {
                Redirect::to(&failed_landing(frontend, Some(order_id)))
            }
        }
        Err(e) => {
            // The browser gets a landing page no matter how mangled the
            // callback was; the webhook remains the source of truth.
            warn!(provider = %provider, error = %e, "Redirect callback could not be reconciled");
            Redirect::to(&failed_landing(frontend, None))
        }
    }
}
