//! JazzCash mobile wallet checkout.
//!
//! Sessions are created with merchant credentials plus an integrity hash:
//! HMAC-SHA256 over the request fields, sorted by name, with the shared
//! salt prepended to the joined values.

use super::{
    amount_major_string, extract_string, http_client, param, parse_order_id, read_json_response,
    CallbackData, GatewaySession, PaymentGateway,
};
use crate::entities::order::{self, PaymentMethod};
use crate::errors::ServiceError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct JazzCashConfig {
    pub merchant_id: String,
    pub password: String,
    pub integrity_salt: String,
    pub base_url: String,
    pub currency: String,
    pub return_url: String,
}

pub struct JazzCashGateway {
    config: JazzCashConfig,
    client: reqwest::Client,
}

impl JazzCashGateway {
    pub fn new(config: JazzCashConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

/// Integrity hash over the request fields: values sorted by field name,
/// joined with `&`, salt prepended, HMAC-SHA256 keyed on the salt.
pub fn secure_hash(integrity_salt: &str, fields: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
    sorted.sort_by_key(|(name, _)| *name);

    let mut message = integrity_salt.to_string();
    for (_, value) in sorted {
        message.push('&');
        message.push_str(value);
    }

    let mut mac = match Hmac::<Sha256>::new_from_slice(integrity_salt.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes()).to_uppercase()
}

#[async_trait]
impl PaymentGateway for JazzCashGateway {
    fn provider(&self) -> PaymentMethod {
        PaymentMethod::Jazzcash
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_session(
        &self,
        order: &order::Model,
    ) -> Result<GatewaySession, ServiceError> {
        let amount = amount_major_string(order.total_price);
        let bill_reference = order.id.to_string();
        let description = format!("Order {}", order.order_number);
        let return_url = format!("{}?order_id={}", self.config.return_url, order.id);

        let fields = [
            ("pp_MerchantID", self.config.merchant_id.as_str()),
            ("pp_Password", self.config.password.as_str()),
            ("pp_Amount", amount.as_str()),
            ("pp_TxnCurrency", self.config.currency.as_str()),
            ("pp_BillReference", bill_reference.as_str()),
            ("pp_Description", description.as_str()),
            ("pp_ReturnURL", return_url.as_str()),
        ];
        let hash = secure_hash(&self.config.integrity_salt, &fields);

        let mut payload = serde_json::Map::new();
        for (name, value) in fields {
            payload.insert(name.to_string(), json!(value));
        }
        payload.insert("pp_SecureHash".to_string(), json!(hash));

        let response = self
            .client
            .post(format!("{}/checkout/session", self.config.base_url))
            .json(&Value::Object(payload))
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("JazzCash unreachable: {}", e))
            })?;

        let body = read_json_response(PaymentMethod::Jazzcash, response).await?;

        let redirect_url =
            extract_string(&body, &["pp_RedirectURL", "redirect_url", "data.redirect_url"])
                .ok_or_else(|| {
                    debug!(body = %body, "JazzCash session response carried no redirect URL");
                    ServiceError::GatewayRejected(PaymentMethod::Jazzcash.to_string())
                })?;

        Ok(GatewaySession {
            redirect_url,
            session_ref: extract_string(&body, &["pp_TxnRefNo", "data.pp_TxnRefNo"]),
        })
    }
}

pub fn parse_webhook(payload: &Value) -> Result<CallbackData, ServiceError> {
    let raw_order = extract_string(payload, &["pp_BillReference", "pp_BillRef"]).ok_or_else(
        || ServiceError::ValidationError("JazzCash webhook carries no order reference".to_string()),
    )?;
    let status_token = extract_string(payload, &["pp_ResponseCode", "pp_Status"]).ok_or_else(
        || ServiceError::ValidationError("JazzCash webhook carries no response code".to_string()),
    )?;

    Ok(CallbackData {
        order_id: parse_order_id(&raw_order)?,
        status_token,
        transaction_id: extract_string(payload, &["pp_TxnRefNo", "pp_RetrievalReferenceNo"]),
        payer_email: None,
    })
}

pub fn parse_redirect(params: &HashMap<String, String>) -> Result<CallbackData, ServiceError> {
    let raw_order = param(params, &["pp_BillReference", "order_id"]).ok_or_else(|| {
        ServiceError::ValidationError("JazzCash return carries no order reference".to_string())
    })?;
    let status_token = param(params, &["pp_ResponseCode", "status"]).ok_or_else(|| {
        ServiceError::ValidationError("JazzCash return carries no response code".to_string())
    })?;

    Ok(CallbackData {
        order_id: parse_order_id(raw_order)?,
        status_token: status_token.to_string(),
        transaction_id: param(params, &["pp_TxnRefNo"]).map(ToString::to_string),
        payer_email: None,
    })
}
