//! Safepay hosted checkout.
//!
//! Session creation returns a tracker token rather than a full URL in most
//! deployments; the redirect is composed from it when no URL is present.

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
pub struct SafepayConfig {
    pub api_key: String,
    pub base_url: String,
    pub currency: String,
    pub return_url: String,
}

pub struct SafepayGateway {
    config: SafepayConfig,
    client: reqwest::Client,
}

impl SafepayGateway {
    pub fn new(config: SafepayConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl PaymentGateway for SafepayGateway {
    fn provider(&self) -> PaymentMethod {
        PaymentMethod::Safepay
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_session(
        &self,
        order: &order::Model,
    ) -> Result<GatewaySession, ServiceError> {
        let payload = json!({
            "client": self.config.api_key,
            "amount": amount_minor_units(order.total_price)?,
            "currency": self.config.currency,
            "reference": order.id,
            "success_url": format!(
                "{}?order_id={}&status=completed",
                self.config.return_url, order.id
            ),
            "cancel_url": format!(
                "{}?order_id={}&status=cancelled",
                self.config.return_url, order.id
            ),
        });

        let response = self
            .client
            .post(format!("{}/order/v1/init", self.config.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("Safepay unreachable: {}", e))
            })?;

        let body = read_json_response(PaymentMethod::Safepay, response).await?;

        let session_ref = extract_string(&body, &["data.token", "token", "tracker"]);

        let redirect_url =
            extract_string(&body, &["redirect_url", "url", "data.checkout_url"]).or_else(|| {
                // No URL in the response: compose the hosted checkout from
                // the tracker token.
                session_ref.as_ref().map(|token| {
                    format!("{}/checkout/pay?tracker={}", self.config.base_url, token)
                })
            });

        let redirect_url = redirect_url.ok_or_else(|| {
            debug!(body = %body, "Safepay session response carried neither URL nor tracker");
            ServiceError::GatewayRejected(PaymentMethod::Safepay.to_string())
        })?;

        Ok(GatewaySession {
            redirect_url,
            session_ref,
        })
    }
}

pub fn parse_webhook(payload: &Value) -> Result<CallbackData, ServiceError> {
    let raw_order = extract_string(payload, &["reference", "order_id", "data.reference"])
        .ok_or_else(|| {
            ServiceError::ValidationError("Safepay webhook carries no order reference".to_string())
        })?;
    let status_token = extract_string(payload, &["status", "state", "data.status"]).ok_or_else(
        || ServiceError::ValidationError("Safepay webhook carries no status".to_string()),
    )?;

    Ok(CallbackData {
        order_id: parse_order_id(&raw_order)?,
        status_token,
        transaction_id: extract_string(payload, &["tracker", "data.tracker"]),
        payer_email: extract_string(payload, &["customer_email", "data.customer.email"]),
    })
}

pub fn parse_redirect(params: &HashMap<String, String>) -> Result<CallbackData, ServiceError> {
    let raw_order = param(params, &["order_id", "reference"]).ok_or_else(|| {
        ServiceError::ValidationError("Safepay return carries no order reference".to_string())
    })?;
    let status_token = param(params, &["status", "state"]).ok_or_else(|| {
        ServiceError::ValidationError("Safepay return carries no status".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(raw_order)?,
        status_token: status_token.to_string(),
        transaction_id: param(params, &["tracker"]).map(ToString::to_string),
        payer_email: None,
    })
}
