use crate::config::AppConfig;
use crate::entities::order::{self, PaymentMethod};
use crate::entities::order_item;
use crate::errors::ServiceError;
use crate::services::reconciliation::sign_payload;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

const DELIVERY_ATTEMPTS: u32 = 3;

/// Snapshot of a finalized order, shaped for the downstream messaging
/// service that composes the actual customer email.
#[derive(Debug, Clone, Serialize)]
pub struct OrderNotification {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub payment_method: PaymentMethod,
    pub total_price: Decimal,
    pub transaction_id: Option<String>,
    pub paid_at: DateTime<Utc>,
    pub items: Vec<NotificationLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationLine {
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl OrderNotification {
    pub fn new(
        order: &order::Model,
        items: &[order_item::Model],
        paid_at: DateTime<Utc>,
        transaction_id: Option<String>,
    ) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            payment_method: order.payment_method,
            total_price: order.total_price,
            transaction_id,
            paid_at,
            items: items
                .iter()
                .map(|item| NotificationLine {
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
        }
    }
}

/// Posts finalized-order snapshots to the configured messaging endpoints.
///
/// Strictly decoupled from the payment transition: dispatch is spawned after
/// the transaction commits, failures are logged and swallowed, and a missing
/// endpoint is a quiet no-op.
#[derive(Clone)]
pub struct NotificationDispatcher {
    client: Client,
    order_url: Option<String>,
    admin_url: Option<String>,
    signing_secret: Option<String>,
}

impl NotificationDispatcher {
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!(
                    "Failed to construct notification HTTP client: {}",
                    e
                ))
            })?;

        Ok(Self {
            client,
            order_url: config.notification_order_url.clone(),
            admin_url: config.notification_admin_url.clone(),
            signing_secret: config.notification_signing_secret.clone(),
        })
    }

    /// Fans out confirmation and alert messages on a detached task.
    pub fn dispatch_order_paid(&self, notification: OrderNotification) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.send_order_confirmation(&notification).await;
            dispatcher.send_admin_alert(&notification).await;
        });
    }

    pub async fn send_order_confirmation(&self, notification: &OrderNotification) {
        self.post_snapshot(self.order_url.clone(), "order_confirmation", notification)
            .await;
    }

    pub async fn send_admin_alert(&self, notification: &OrderNotification) {
        self.post_snapshot(self.admin_url.clone(), "admin_alert", notification)
            .await;
    }

    async fn post_snapshot(
        &self,
        url: Option<String>,
        kind: &str,
        notification: &OrderNotification,
    ) {
        let Some(url) = url else {
            debug!(kind = kind, "Notification endpoint not configured, skipping");
            return;
        };

        match self.deliver(&url, notification).await {
            Ok(()) => {
                info!(kind = kind, order_id = %notification.order_id, "Notification delivered")
            }
            Err(e) => {
                error!(
                    kind = kind,
                    order_id = %notification.order_id,
                    error = %e,
                    "Notification delivery failed"
                )
            }
        }
    }

    async fn deliver(
        &self,
        url: &str,
        notification: &OrderNotification,
    ) -> Result<(), ServiceError> {
        let body = serde_json::to_vec(notification).map_err(|e| {
            ServiceError::InternalError(format!("Failed to serialize notification: {}", e))
        })?;

        let mut last_error = None;
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match self.post_once(url, &body).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        attempt = attempt,
                        error = %e,
                        "Notification attempt failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < DELIVERY_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(500 * 2u64.pow(attempt - 1))).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ServiceError::ExternalServiceError("Notification delivery failed".to_string())
        }))
    }

    async fn post_once(&self, url: &str, body: &[u8]) -> Result<(), ServiceError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(secret) = &self.signing_secret {
            let timestamp = Utc::now().timestamp();
            request = request
                .header("x-timestamp", timestamp.to_string())
                .header("x-signature", sign_payload(secret, timestamp, body));
        }

        let response = request.send().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("Notification endpoint unreachable: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "Notification endpoint answered {}",
                response.status()
            )));
        }

        Ok(())
    }
}
