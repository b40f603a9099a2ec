//! Generic hosted card checkout.
//!
//! Speaks to a conventional PSP REST API: bearer-authenticated JSON session
//! creation with amounts in minor units.

use super::{
    amount_minor_units, extract_string, http_client, param, parse_order_id, read_json_response,
    CallbackData, GatewaySession, PaymentGateway,
};
use crate::entities::order::{self, PaymentMethod};
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct CardConfig {
    pub api_key: String,
    pub base_url: String,
    pub currency: String,
    pub return_url: String,
}

pub struct CardGateway {
    config: CardConfig,
    client: reqwest::Client,
}

impl CardGateway {
    pub fn new(config: CardConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    fn provider(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_session(
        &self,
        order: &order::Model,
    ) -> Result<GatewaySession, ServiceError> {
        let payload = json!({
            "amount": amount_minor_units(order.total_price)?,
            "currency": self.config.currency,
            "reference": order.id,
            "description": format!("Order {}", order.order_number),
            "success_url": format!(
                "{}?order_id={}&status=succeeded",
                self.config.return_url, order.id
            ),
            "cancel_url": format!(
                "{}?order_id={}&status=cancelled",
                self.config.return_url, order.id
            ),
        });

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("Card provider unreachable: {}", e))
            })?;

        let body = read_json_response(PaymentMethod::Card, response).await?;

        let redirect_url =
            extract_string(&body, &["checkout_url", "redirect_url", "url", "data.checkout_url"])
                .ok_or_else(|| {
                    debug!(body = %body, "Card session response carried no redirect URL");
                    ServiceError::GatewayRejected(PaymentMethod::Card.to_string())
                })?;

        Ok(GatewaySession {
            redirect_url,
            session_ref: extract_string(&body, &["id", "session_id", "data.id"]),
        })
    }
}

pub fn parse_webhook(payload: &Value) -> Result<CallbackData, ServiceError> {
    let raw_order = extract_string(payload, &["reference", "order_id", "data.reference"])
        .ok_or_else(|| {
            ServiceError::ValidationError("Card webhook carries no order reference".to_string())
        })?;
    let status_token = extract_string(payload, &["status", "data.status"]).ok_or_else(|| {
        ServiceError::ValidationError("Card webhook carries no status".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(&raw_order)?,
        status_token,
        transaction_id: extract_string(payload, &["transaction_id", "id", "data.id"]),
        payer_email: extract_string(payload, &["payer_email", "customer_email"]),
    })
}

pub fn parse_redirect(params: &HashMap<String, String>) -> Result<CallbackData, ServiceError> {
    let raw_order = param(params, &["order_id", "reference"]).ok_or_else(|| {
        ServiceError::ValidationError("Card return carries no order reference".to_string())
    })?;
    let status_token = param(params, &["status"]).ok_or_else(|| {
        ServiceError::ValidationError("Card return carries no status".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(raw_order)?,
        status_token: status_token.to_string(),
        transaction_id: param(params, &["transaction_id", "session_id"]).map(ToString::to_string),
        payer_email: None,
    })
}
