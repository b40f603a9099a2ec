//! Stripe Checkout.
//!
//! Sessions use the form-encoded `/v1/checkout/sessions` API with a single
//! consolidated line item for the order total. Webhook events nest the
//! session under `data.object`.

use super::{
    amount_minor_units, extract_string, http_client, param, parse_order_id, read_json_response,
    CallbackData, GatewaySession, PaymentGateway,
};
use crate::entities::order::{self, PaymentMethod};
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub base_url: String,
    pub currency: String,
    pub return_url: String,
}

pub struct StripeGateway {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_session(
        &self,
        order: &order::Model,
    ) -> Result<GatewaySession, ServiceError> {
        let unit_amount = amount_minor_units(order.total_price)?.to_string();
        let currency = self.config.currency.to_lowercase();
        let order_id = order.id.to_string();
        let product_name = format!("Order {}", order.order_number);
        let success_url = format!(
            "{}?order_id={}&status=paid",
            self.config.return_url, order.id
        );
        let cancel_url = format!(
            "{}?order_id={}&status=cancelled",
            self.config.return_url, order.id
        );

        let form = [
            ("mode", "payment"),
            ("client_reference_id", order_id.as_str()),
            ("success_url", success_url.as_str()),
            ("cancel_url", cancel_url.as_str()),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", currency.as_str()),
            (
                "line_items[0][price_data][unit_amount]",
                unit_amount.as_str(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                product_name.as_str(),
            ),
        ];

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("Stripe unreachable: {}", e))
            })?;

        let body = read_json_response(PaymentMethod::Stripe, response).await?;

        let redirect_url = extract_string(&body, &["url"]).ok_or_else(|| {
            debug!(body = %body, "Stripe session response carried no redirect URL");
            ServiceError::GatewayRejected(PaymentMethod::Stripe.to_string())
        })?;

        Ok(GatewaySession {
            redirect_url,
            session_ref: extract_string(&body, &["id"]),
        })
    }
}

pub fn parse_webhook(payload: &Value) -> Result<CallbackData, ServiceError> {
    let raw_order = extract_string(
        payload,
        &["data.object.client_reference_id", "client_reference_id"],
    )
    .ok_or_else(|| {
        ServiceError::ValidationError("Stripe event carries no client reference".to_string())
    })?;
    let status_token = extract_string(
        payload,
        &["data.object.payment_status", "data.object.status", "status"],
    )
    .ok_or_else(|| {
        ServiceError::ValidationError("Stripe event carries no payment status".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(&raw_order)?,
        status_token,
        transaction_id: extract_string(
            payload,
            &["data.object.payment_intent", "data.object.id", "id"],
        ),
        payer_email: extract_string(
            payload,
            &[
                "data.object.customer_details.email",
                "data.object.customer_email",
            ],
        ),
    })
}

pub fn parse_redirect(params: &HashMap<String, String>) -> Result<CallbackData, ServiceError> {
    let raw_order = param(params, &["order_id", "client_reference_id"]).ok_or_else(|| {
        ServiceError::ValidationError("Stripe return carries no order reference".to_string())
    })?;
    let status_token = param(params, &["status"]).ok_or_else(|| {
        ServiceError::ValidationError("Stripe return carries no status".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(raw_order)?,
        status_token: status_token.to_string(),
        transaction_id: param(params, &["session_id"]).map(ToString::to_string),
        payer_email: None,
    })
}
