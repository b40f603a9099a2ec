//! Easypaisa wallet checkout.
//!
//! Session requests carry a SHA-256 request hash over store id, order
//! reference, amount, and the shared hash key.

use super::{
    amount_major_string, extract_string, http_client, param, parse_order_id, read_json_response,
    CallbackData, GatewaySession, PaymentGateway,
};
use crate::entities::order::{self, PaymentMethod};
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct EasypaisaConfig {
    pub store_id: String,
    pub hash_key: String,
    pub base_url: String,
    pub return_url: String,
}

pub struct EasypaisaGateway {
    config: EasypaisaConfig,
    client: reqwest::Client,
}

impl EasypaisaGateway {
    pub fn new(config: EasypaisaConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

/// Request hash: SHA-256 over `store_id&order_ref&amount&hash_key`, hex.
pub fn request_hash(store_id: &str, order_ref: &str, amount: &str, hash_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(store_id.as_bytes());
    hasher.update(b"&");
    hasher.update(order_ref.as_bytes());
    hasher.update(b"&");
    hasher.update(amount.as_bytes());
    hasher.update(b"&");
    hasher.update(hash_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl PaymentGateway for EasypaisaGateway {
    fn provider(&self) -> PaymentMethod {
        PaymentMethod::Easypaisa
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_session(
        &self,
        order: &order::Model,
    ) -> Result<GatewaySession, ServiceError> {
        let amount = amount_major_string(order.total_price);
        let order_ref = order.id.to_string();

        let payload = json!({
            "storeId": self.config.store_id,
            "orderRefNum": order_ref,
            "transactionAmount": amount,
            "postBackURL": format!("{}?order_id={}", self.config.return_url, order.id),
            "merchantHashedReq": request_hash(
                &self.config.store_id,
                &order_ref,
                &amount,
                &self.config.hash_key,
            ),
        });

        let response = self
            .client
            .post(format!("{}/transactions", self.config.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("Easypaisa unreachable: {}", e))
            })?;

        let body = read_json_response(PaymentMethod::Easypaisa, response).await?;

        let redirect_url =
            extract_string(&body, &["paymentUrl", "redirectUrl", "url", "data.paymentUrl"])
                .ok_or_else(|| {
                    debug!(body = %body, "Easypaisa session response carried no redirect URL");
                    ServiceError::GatewayRejected(PaymentMethod::Easypaisa.to_string())
                })?;

        Ok(GatewaySession {
            redirect_url,
            session_ref: extract_string(&body, &["transactionId", "data.transactionId"]),
        })
    }
}

pub fn parse_webhook(payload: &Value) -> Result<CallbackData, ServiceError> {
    let raw_order = extract_string(payload, &["orderRefNum", "orderRefNumber"]).ok_or_else(
        || ServiceError::ValidationError("Easypaisa webhook carries no order reference".to_string()),
    )?;
    let status_token = extract_string(payload, &["responseCode", "status"]).ok_or_else(|| {
        ServiceError::ValidationError("Easypaisa webhook carries no response code".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(&raw_order)?,
        status_token,
        transaction_id: extract_string(payload, &["transactionId", "transactionRefNumber"]),
        payer_email: None,
    })
}

pub fn parse_redirect(params: &HashMap<String, String>) -> Result<CallbackData, ServiceError> {
    let raw_order = param(params, &["orderRefNum", "order_id"]).ok_or_else(|| {
        ServiceError::ValidationError("Easypaisa return carries no order reference".to_string())
    })?;
    let status_token = param(params, &["responseCode", "status"]).ok_or_else(|| {
        ServiceError::ValidationError("Easypaisa return carries no response code".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(raw_order)?,
        status_token: status_token.to_string(),
        transaction_id: param(params, &["transactionId"]).map(ToString::to_string),
        payer_email: None,
    })
}
