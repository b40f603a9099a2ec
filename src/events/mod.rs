use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderPaid(Uuid),
    OrderCancelled(Uuid),
    OrderDelivered(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment reconciliation
    PaymentFailed {
        order_id: Uuid,
        provider: String,
        reason: Option<String>,
    },
    CouponRedeemed {
        code: String,
        order_id: Uuid,
    },
    StockShortfall {
        product_id: Uuid,
        order_id: Uuid,
        requested: i32,
        available: i32,
    },
}

/// Drains the application event channel, logging each event.
///
/// Runs until every `EventSender` clone has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated(order_id) => {
                info!("Order created: order_id={}", order_id);
            }
            Event::OrderPaid(order_id) => {
                info!("Order paid: order_id={}", order_id);
            }
            Event::OrderCancelled(order_id) => {
                info!("Order cancelled: order_id={}", order_id);
            }
            Event::OrderDelivered(order_id) => {
                info!("Order delivered: order_id={}", order_id);
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    "Order status changed: order_id={}, {} -> {}",
                    order_id, old_status, new_status
                );
            }
            Event::PaymentFailed {
                order_id,
                provider,
                reason,
            } => {
                warn!(
                    "Payment failed: order_id={}, provider={}, reason={}",
                    order_id,
                    provider,
                    reason.as_deref().unwrap_or("unknown")
                );
            }
            Event::CouponRedeemed { code, order_id } => {
                info!("Coupon redeemed: code={}, order_id={}", code, order_id);
            }
            Event::StockShortfall {
                product_id,
                order_id,
                requested,
                available,
            } => {
                warn!(
                    "Stock shortfall on paid order: product_id={}, order_id={}, requested={}, available={}",
                    product_id, order_id, requested, available
                );
            }
        }
    }

    info!("Event processing loop stopped");
}
