//! Payment gateway adapters.
//!
//! One adapter per provider, all speaking the same contract: turn an unpaid
//! order into a hosted payment session, and normalize the provider's
//! callbacks into [`CallbackData`]. Nothing outside this module branches on
//! provider response shapes.

pub mod card;
pub mod easypaisa;
pub mod jazzcash;
pub mod safepay;
pub mod stripe;

use crate::config::AppConfig;
use crate::entities::order::{self, PaymentMethod};
use crate::errors::ServiceError;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A hosted payment session created with a provider. The session is an
/// invitation to pay, never proof of payment.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub redirect_url: String,
    pub session_ref: Option<String>,
}

/// Canonical form of a provider callback, webhook or browser redirect.
#[derive(Debug, Clone)]
pub struct CallbackData {
    pub order_id: Uuid,
    pub status_token: String,
    pub transaction_id: Option<String>,
    pub payer_email: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentMethod;

    /// Creates a payment session for an unpaid order and returns where to
    /// send the customer's browser.
    async fn create_session(&self, order: &order::Model)
        -> Result<GatewaySession, ServiceError>;
}

/// The set of gateways that have complete credentials. Providers with
/// missing configuration are simply absent and surface as 503s.
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let mut gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>> = HashMap::new();

        if let Some(cfg) = config.build_card_config() {
            gateways.insert(PaymentMethod::Card, Arc::new(card::CardGateway::new(cfg)?));
        }
        if let Some(cfg) = config.build_jazzcash_config() {
            gateways.insert(
                PaymentMethod::Jazzcash,
                Arc::new(jazzcash::JazzCashGateway::new(cfg)?),
            );
        }
        if let Some(cfg) = config.build_easypaisa_config() {
            gateways.insert(
                PaymentMethod::Easypaisa,
                Arc::new(easypaisa::EasypaisaGateway::new(cfg)?),
            );
        }
        if let Some(cfg) = config.build_safepay_config() {
            gateways.insert(
                PaymentMethod::Safepay,
                Arc::new(safepay::SafepayGateway::new(cfg)?),
            );
        }
        if let Some(cfg) = config.build_stripe_config() {
            gateways.insert(
                PaymentMethod::Stripe,
                Arc::new(stripe::StripeGateway::new(cfg)?),
            );
        }

        let configured: Vec<String> = gateways.keys().map(|p| p.to_string()).collect();
        info!(providers = ?configured, "Payment gateways configured");

        Ok(Self { gateways })
    }

    pub fn get(&self, provider: PaymentMethod) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or_else(|| ServiceError::GatewayUnconfigured(provider.to_string()))
    }

    pub fn is_configured(&self, provider: PaymentMethod) -> bool {
        self.gateways.contains_key(&provider)
    }
}

/// Parses a raw webhook body into the canonical callback form.
///
/// Only called after signature verification has passed.
pub fn parse_webhook(provider: PaymentMethod, body: &[u8]) -> Result<CallbackData, ServiceError> {
    let payload: Value = serde_json::from_slice(body).map_err(|_| {
        ServiceError::ValidationError("Webhook payload is not valid JSON".to_string())
    })?;

    match provider {
        PaymentMethod::Card => card::parse_webhook(&payload),
        PaymentMethod::Jazzcash => jazzcash::parse_webhook(&payload),
        PaymentMethod::Easypaisa => easypaisa::parse_webhook(&payload),
        PaymentMethod::Safepay => safepay::parse_webhook(&payload),
        PaymentMethod::Stripe => stripe::parse_webhook(&payload),
        PaymentMethod::Cod => Err(ServiceError::ValidationError(
            "Cash on delivery has no payment callbacks".to_string(),
        )),
    }
}

/// Parses browser-return query parameters into the canonical callback form.
pub fn parse_redirect(
    provider: PaymentMethod,
    params: &HashMap<String, String>,
) -> Result<CallbackData, ServiceError> {
    match provider {
        PaymentMethod::Card => card::parse_redirect(params),
        PaymentMethod::Jazzcash => jazzcash::parse_redirect(params),
        PaymentMethod::Easypaisa => easypaisa::parse_redirect(params),
        PaymentMethod::Safepay => safepay::parse_redirect(params),
        PaymentMethod::Stripe => stripe::parse_redirect(params),
        PaymentMethod::Cod => Err(ServiceError::ValidationError(
            "Cash on delivery has no payment callbacks".to_string(),
        )),
    }
}

/// Converts a major-unit amount into integer minor units (cents, paisa).
pub(crate) fn amount_minor_units(total: Decimal) -> Result<i64, ServiceError> {
    (total * dec!(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            ServiceError::InternalError("Order total exceeds the representable amount".to_string())
        })
}

/// Formats a major-unit amount with exactly two decimal places, the form
/// the wallet providers expect.
pub(crate) fn amount_major_string(total: Decimal) -> String {
    let mut amount = crate::services::pricing::round_money(total);
    amount.rescale(2);
    amount.to_string()
}

fn string_at<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    current.as_str()
}

/// Tries the given dotted paths in order and returns the first non-empty
/// string. Providers disagree on field names even within their own APIs.
pub(crate) fn extract_string(value: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| string_at(value, path))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// First non-empty query parameter among the candidate names.
pub(crate) fn param<'a>(params: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| params.get(*key))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

pub(crate) fn parse_order_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        ServiceError::ValidationError("Callback carries an invalid order reference".to_string())
    })
}

pub(crate) fn http_client() -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| ServiceError::InternalError(format!("Failed to construct HTTP client: {}", e)))
}

/// Reads a provider response, logging rejected requests at debug. The raw
/// provider body is never surfaced to callers.
pub(crate) async fn read_json_response(
    provider: PaymentMethod,
    response: reqwest::Response,
) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response.bytes().await.map_err(|e| {
        ServiceError::ExternalServiceError(format!(
            "Failed to read {} response: {}",
            provider, e
        ))
    })?;

    if !status.is_success() {
        debug!(
            provider = %provider,
            status = %status,
            body = %String::from_utf8_lossy(&body),
            "Provider rejected the session request"
        );
        return Err(ServiceError::GatewayRejected(provider.to_string()));
    }

    serde_json::from_slice(&body).map_err(|_| {
        debug!(
            provider = %provider,
            body = %String::from_utf8_lossy(&body),
            "Provider returned a non-JSON session response"
        );
        ServiceError::GatewayRejected(provider.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minor_units_round_half_up() {
        assert_eq!(amount_minor_units(dec!(103.5)).unwrap(), 10350);
        assert_eq!(amount_minor_units(dec!(0.005)).unwrap(), 1);
        assert_eq!(amount_minor_units(dec!(0)).unwrap(), 0);
    }

    #[test]
    fn major_string_always_carries_two_decimals() {
        assert_eq!(amount_major_string(dec!(103.5)), "103.50");
        assert_eq!(amount_major_string(dec!(7)), "7.00");
        assert_eq!(amount_major_string(dec!(0.129)), "0.13");
    }

    #[test]
    fn extract_string_walks_nested_paths_in_order() {
        let payload = json!({
            "data": { "checkout_url": "https://pay.example/1" },
            "url": "https://pay.example/2",
        });

        assert_eq!(
            extract_string(&payload, &["checkout_url", "url", "data.checkout_url"]),
            Some("https://pay.example/2".to_string())
        );
        assert_eq!(
            extract_string(&payload, &["data.checkout_url", "url"]),
            Some("https://pay.example/1".to_string())
        );
        assert_eq!(extract_string(&payload, &["missing", "also.missing"]), None);
    }

    #[test]
    fn extract_string_ignores_empty_values() {
        let payload = json!({ "url": "  ", "redirect_url": "https://pay.example" });
        assert_eq!(
            extract_string(&payload, &["url", "redirect_url"]),
            Some("https://pay.example".to_string())
        );
    }

    #[test]
    fn malformed_webhook_body_is_a_validation_error() {
        let result = parse_webhook(PaymentMethod::Card, b"not json");
        assert!(matches!(result, Err(ServiceError::ValidationError(_))));
    }

    #[test]
    fn cod_has_no_callbacks() {
        assert!(parse_webhook(PaymentMethod::Cod, b"{}").is_err());
        assert!(parse_redirect(PaymentMethod::Cod, &HashMap::new()).is_err());
    }
}
