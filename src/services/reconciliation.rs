//! Payment reconciliation.
//!
//! Webhooks and browser-return callbacks both land here. Whatever the
//! trigger, the paid transition runs at most once per order: the gate is a
//! single conditional UPDATE on `is_paid = false`, and every side effect
//! (stock decrement, coupon redemption, notifications) hangs off winning
//! that update.

use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, PaymentMethod},
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{self, CallbackData},
    services::catalog::{CatalogService, StockDecrement},
    services::coupons::CouponService,
    services::notifications::{NotificationDispatcher, OrderNotification},
};
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// The union of every provider's success vocabulary. Anything outside this
/// set is a failure: the predicate fails closed.
const SUCCESS_TOKENS: &[&str] = &[
    "paid",
    "success",
    "succeeded",
    "completed",
    "approved",
    "000",
    "00",
    "true",
    "1",
    "yes",
];

const PAID_STATUS: &str = "paid";
const FAILURE_STATUS_MAX_LEN: usize = 64;

pub fn is_success_token(token: &str) -> bool {
    let normalized = token.trim().to_ascii_lowercase();
    SUCCESS_TOKENS.contains(&normalized.as_str())
}

fn compute_signature(secret: &str, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Hex signature over `{timestamp}.{body}`. Shared by webhook verification
/// and outbound notification signing.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    hex::encode(compute_signature(secret, timestamp, body))
}

/// Byte comparison that does not short-circuit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies webhook authenticity against the raw, unparsed body.
///
/// Accepts either the plain `x-timestamp`/`x-signature` header pair or a
/// Stripe-style `stripe-signature: t=...,v1=...` header. An unconfigured
/// secret rejects everything.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.trim().is_empty()),
            tolerance,
        }
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            ServiceError::InvalidSignature("Webhook signing secret is not configured".to_string())
        })?;

        let (timestamp, provided_hex) = extract_signature(headers)?;

        let age = (Utc::now().timestamp() - timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            return Err(ServiceError::InvalidSignature(format!(
                "Webhook timestamp outside tolerance: {}s",
                age
            )));
        }

        let provided = hex::decode(provided_hex.trim()).map_err(|_| {
            ServiceError::InvalidSignature("Signature is not valid hex".to_string())
        })?;
        let expected = compute_signature(secret, timestamp, body);

        if expected.is_empty() || !constant_time_eq(&expected, &provided) {
            return Err(ServiceError::InvalidSignature(
                "Signature mismatch".to_string(),
            ));
        }

        Ok(())
    }
}

fn extract_signature(headers: &HeaderMap) -> Result<(i64, String), ServiceError> {
    if let Some(value) = headers.get("stripe-signature") {
        let raw = value.to_str().map_err(|_| {
            ServiceError::InvalidSignature("Unreadable signature header".to_string())
        })?;

        let mut timestamp = None;
        let mut signature = None;
        for part in raw.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
                Some(("v1", v)) => signature = Some(v.to_string()),
                _ => {}
            }
        }

        return match (timestamp, signature) {
            (Some(t), Some(s)) => Ok((t, s)),
            _ => Err(ServiceError::InvalidSignature(
                "Signature header is missing t= or v1=".to_string(),
            )),
        };
    }

    let timestamp = headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            ServiceError::InvalidSignature("Missing or malformed timestamp header".to_string())
        })?;
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            ServiceError::InvalidSignature("Missing signature header".to_string())
        })?;

    Ok((timestamp, signature))
}

/// What a reconciliation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call won the gate and performed the side effects.
    Finalized,
    /// The order was already paid; nothing was re-applied.
    AlreadyPaid,
    /// The provider reported failure; recorded, order stays unpaid.
    Failed,
    /// No such order. Terminal: acknowledged so the provider stops retrying.
    OrderMissing,
}

impl ReconcileOutcome {
    /// True when the browser should land on the success page.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finalized | Self::AlreadyPaid)
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    catalog: CatalogService,
    coupons: CouponService,
    notifications: NotificationDispatcher,
    verifier: WebhookVerifier,
    event_sender: EventSender,
}

impl ReconciliationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        catalog: CatalogService,
        coupons: CouponService,
        notifications: NotificationDispatcher,
        verifier: WebhookVerifier,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db_pool,
            catalog,
            coupons,
            notifications,
            verifier,
            event_sender,
        }
    }

    /// Server-to-server webhook path. The signature is checked against the
    /// raw body before anything is parsed.
    #[instrument(skip(self, headers, body), fields(provider = %provider))]
    pub async fn process_webhook(
        &self,
        provider: PaymentMethod,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.verifier.verify(headers, body)?;
        let callback = gateways::parse_webhook(provider, body)?;
        self.reconcile(provider, callback).await
    }

    /// Browser return path. Lower trust: status is re-derived from the
    /// provider's own parameters, and the outcome only picks the landing
    /// page, it grants nothing the webhook would not.
    #[instrument(skip(self, params), fields(provider = %provider))]
    pub async fn process_redirect(
        &self,
        provider: PaymentMethod,
        params: &HashMap<String, String>,
    ) -> Result<(ReconcileOutcome, Uuid), ServiceError> {
        let callback = gateways::parse_redirect(provider, params)?;
        let order_id = callback.order_id;
        let outcome = self.reconcile(provider, callback).await?;
        Ok((outcome, order_id))
    }

    /// Cash-on-delivery confirmation: delivery marking doubles as payment
    /// confirmation and runs the same exactly-once finalizer.
    pub async fn confirm_cod(
        &self,
        order: &order::Model,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let reference = format!("COD-{}", order.order_number);
        self.finalize_payment(order, PaymentMethod::Cod, Some(reference), None)
            .await
    }

    async fn reconcile(
        &self,
        provider: PaymentMethod,
        callback: CallbackData,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let order = OrderEntity::find_by_id(callback.order_id)
            .one(&*self.db_pool)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %callback.order_id, "Failed to load order for reconciliation");
                ServiceError::DatabaseError(e)
            })?;

        let Some(order) = order else {
            warn!(
                provider = %provider,
                order_id = %callback.order_id,
                "Callback references an unknown order, acknowledging to stop retries"
            );
            return Ok(ReconcileOutcome::OrderMissing);
        };

        if is_success_token(&callback.status_token) {
            self.finalize_payment(
                &order,
                provider,
                callback.transaction_id,
                callback.payer_email,
            )
            .await
        } else {
            self.record_failure(&order, provider, &callback.status_token)
                .await
        }
    }

    /// The exactly-once transition. Payment state, stock decrements, and
    /// coupon redemption commit in one transaction; notifications run after
    /// the commit on a detached task.
    async fn finalize_payment(
        &self,
        order: &order::Model,
        provider: PaymentMethod,
        transaction_id: Option<String>,
        payer_email: Option<String>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if order.is_paid {
            info!(order_id = %order.id, "Order already paid, duplicate confirmation ignored");
            return Ok(ReconcileOutcome::AlreadyPaid);
        }

        let now = Utc::now();
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, order_id = %order.id, "Failed to start finalization transaction");
            ServiceError::DatabaseError(e)
        })?;

        let gate = OrderEntity::update_many()
            .col_expr(order::Column::IsPaid, Expr::value(true))
            .col_expr(order::Column::PaidAt, Expr::value(now))
            .col_expr(order::Column::PaymentStatus, Expr::value(PAID_STATUS))
            .col_expr(
                order::Column::TransactionId,
                Expr::value(transaction_id.clone()),
            )
            .col_expr(order::Column::PayerEmail, Expr::value(payer_email))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&txn)
            .await?;

        if gate.rows_affected == 0 {
            // Lost the race to another callback. Nothing to roll back.
            txn.rollback().await.map_err(ServiceError::DatabaseError)?;
            info!(order_id = %order.id, "Order already paid, duplicate confirmation ignored");
            return Ok(ReconcileOutcome::AlreadyPaid);
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;

        let mut shortfalls = Vec::new();
        for item in &items {
            match self
                .catalog
                .decrement_stock(&txn, item.product_id, item.quantity)
                .await?
            {
                StockDecrement::Applied => {}
                StockDecrement::Clamped { available } => {
                    shortfalls.push((item.product_id, item.quantity, available));
                }
            }
        }

        if let Some(code) = &order.coupon_code {
            self.coupons.redeem(&txn, code).await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order.id, "Failed to commit payment finalization");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order.id,
            provider = %provider,
            transaction_id = transaction_id.as_deref().unwrap_or("-"),
            "Payment finalized"
        );

        if let Err(e) = self.event_sender.send(Event::OrderPaid(order.id)).await {
            warn!(error = %e, order_id = %order.id, "Failed to send order paid event");
        }
        if let Some(code) = &order.coupon_code {
            if let Err(e) = self
                .event_sender
                .send(Event::CouponRedeemed {
                    code: code.clone(),
                    order_id: order.id,
                })
                .await
            {
                warn!(error = %e, order_id = %order.id, "Failed to send coupon redeemed event");
            }
        }
        for (product_id, requested, available) in shortfalls {
            warn!(
                order_id = %order.id,
                product_id = %product_id,
                requested = requested,
                available = available,
                "Order finalized against insufficient stock"
            );
            if let Err(e) = self
                .event_sender
                .send(Event::StockShortfall {
                    product_id,
                    order_id: order.id,
                    requested,
                    available,
                })
                .await
            {
                warn!(error = %e, order_id = %order.id, "Failed to send stock shortfall event");
            }
        }

        let snapshot = OrderNotification::new(order, &items, now, transaction_id);
        self.notifications.dispatch_order_paid(snapshot);

        Ok(ReconcileOutcome::Finalized)
    }

    /// Records a failed confirmation. Guarded on `is_paid = false` so a
    /// stale failure can never downgrade a paid order.
    async fn record_failure(
        &self,
        order: &order::Model,
        provider: PaymentMethod,
        status_token: &str,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if order.is_paid {
            info!(
                order_id = %order.id,
                "Ignoring failure callback for an already paid order"
            );
            return Ok(ReconcileOutcome::AlreadyPaid);
        }

        let normalized = status_token.trim().to_ascii_lowercase();
        let recorded: String = if normalized.is_empty() {
            "failed".to_string()
        } else {
            normalized.chars().take(FAILURE_STATUS_MAX_LEN).collect()
        };

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(recorded.clone()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&*self.db_pool)
            .await?;

        if updated.rows_affected == 0 {
            info!(
                order_id = %order.id,
                "Ignoring failure callback for an already paid order"
            );
            return Ok(ReconcileOutcome::AlreadyPaid);
        }

        info!(
            order_id = %order.id,
            provider = %provider,
            status = %recorded,
            "Payment failure recorded"
        );

        if let Err(e) = self
            .event_sender
            .send(Event::PaymentFailed {
                order_id: order.id,
                provider: provider.to_string(),
                reason: Some(recorded),
            })
            .await
        {
            warn!(error = %e, order_id = %order.id, "Failed to send payment failed event");
        }

        Ok(ReconcileOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use test_case::test_case;

    #[test_case("paid", true)]
    #[test_case("Success", true)]
    #[test_case(" succeeded ", true)]
    #[test_case("COMPLETED", true)]
    #[test_case("approved", true)]
    #[test_case("000", true)]
    #[test_case("00", true)]
    #[test_case("true", true)]
    #[test_case("1", true)]
    #[test_case("yes", true)]
    #[test_case("pending", false)]
    #[test_case("failed", false)]
    #[test_case("cancelled", false)]
    #[test_case("0000", false)]
    #[test_case("", false)]
    fn success_predicate_fails_closed(token: &str, expected: bool) {
        assert_eq!(is_success_token(token), expected);
    }

    #[test]
    fn constant_time_eq_compares_correctly() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    fn signed_headers(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-timestamp",
            HeaderValue::from_str(&timestamp.to_string()).unwrap(),
        );
        headers.insert(
            "x-signature",
            HeaderValue::from_str(&sign_payload(secret, timestamp, body)).unwrap(),
        );
        headers
    }

    #[test]
    fn verify_accepts_a_fresh_correct_signature() {
        let verifier =
            WebhookVerifier::new(Some("shhh".to_string()), Duration::from_secs(300));
        let body = br#"{"status":"paid"}"#;
        let headers = signed_headers("shhh", Utc::now().timestamp(), body);
        assert!(verifier.verify(&headers, body).is_ok());
    }

    #[test]
    fn verify_accepts_the_stripe_header_scheme() {
        let verifier =
            WebhookVerifier::new(Some("shhh".to_string()), Duration::from_secs(300));
        let body = br#"{"status":"paid"}"#;
        let timestamp = Utc::now().timestamp();
        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!(
                "t={},v1={}",
                timestamp,
                sign_payload("shhh", timestamp, body)
            ))
            .unwrap(),
        );
        assert!(verifier.verify(&headers, body).is_ok());
    }

    #[test]
    fn verify_rejects_a_tampered_body() {
        let verifier =
            WebhookVerifier::new(Some("shhh".to_string()), Duration::from_secs(300));
        let headers = signed_headers("shhh", Utc::now().timestamp(), br#"{"status":"paid"}"#);
        let result = verifier.verify(&headers, br#"{"status":"PAID!"}"#);
        assert!(matches!(result, Err(ServiceError::InvalidSignature(_))));
    }

    #[test]
    fn verify_rejects_a_stale_timestamp() {
        let verifier =
            WebhookVerifier::new(Some("shhh".to_string()), Duration::from_secs(300));
        let body = b"{}";
        let stale = Utc::now().timestamp() - 3600;
        let headers = signed_headers("shhh", stale, body);
        let result = verifier.verify(&headers, body);
        assert!(matches!(result, Err(ServiceError::InvalidSignature(_))));
    }

    #[test]
    fn verify_rejects_when_no_secret_is_configured() {
        let verifier = WebhookVerifier::new(None, Duration::from_secs(300));
        let headers = signed_headers("anything", Utc::now().timestamp(), b"{}");
        let result = verifier.verify(&headers, b"{}");
        assert!(matches!(result, Err(ServiceError::InvalidSignature(_))));

        let blank = WebhookVerifier::new(Some("  ".to_string()), Duration::from_secs(300));
        assert!(blank.verify(&headers, b"{}").is_err());
    }

    #[test]
    fn verify_rejects_missing_headers_and_junk_signatures() {
        let verifier =
            WebhookVerifier::new(Some("shhh".to_string()), Duration::from_secs(300));
        assert!(verifier.verify(&HeaderMap::new(), b"{}").is_err());

        let mut headers = signed_headers("shhh", Utc::now().timestamp(), b"{}");
        headers.insert("x-signature", HeaderValue::from_static("not-hex!"));
        assert!(verifier.verify(&headers, b"{}").is_err());
    }

    #[test]
    fn signatures_are_deterministic_and_keyed() {
        let a = sign_payload("secret", 1_700_000_000, b"body");
        assert_eq!(a, sign_payload("secret", 1_700_000_000, b"body"));
        assert_ne!(a, sign_payload("secret", 1_700_000_001, b"body"));
        assert_ne!(a, sign_payload("other", 1_700_000_000, b"body"));
        assert_eq!(a.len(), 64);
    }
}
