use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentMethod, ShippingAddress},
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::CatalogService,
    services::coupons::{CouponDecision, CouponService},
    services::pricing::{CartLine, PricingEngine},
    services::reconciliation::ReconciliationService,
};
use chrono::Utc;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const ORDER_NUMBER_PREFIX: &str = "ORD";
pub const TRACKING_NUMBER_PREFIX: &str = "TRK";
const ORDER_NUMBER_LEN: usize = 8;
const TRACKING_NUMBER_LEN: usize = 12;
const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_REFERENCE_ATTEMPTS: u32 = 5;

/// A freshly placed order with its line snapshots and the coupon decision
/// that shaped the totals.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub coupon: CouponDecision,
}

fn random_reference(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..REFERENCE_ALPHABET.len());
            REFERENCE_ALPHABET[idx] as char
        })
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Generates a display/tracking reference and re-rolls on collision.
/// References are assigned exactly once; orders never get renumbered.
async fn unique_reference<C: ConnectionTrait>(
    conn: &C,
    column: order::Column,
    prefix: &str,
    len: usize,
) -> Result<String, ServiceError> {
    for _ in 0..MAX_REFERENCE_ATTEMPTS {
        let candidate = random_reference(prefix, len);
        let taken = OrderEntity::find()
            .filter(column.eq(candidate.clone()))
            .count(conn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
        warn!(reference = %candidate, "Reference collision, retrying");
    }

    Err(ServiceError::InternalError(
        "Could not allocate a unique order reference".to_string(),
    ))
}

fn status_rank(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Processing => 0,
        OrderStatus::Shipped => 1,
        OrderStatus::OutForDelivery => 2,
        OrderStatus::Delivered => 3,
        OrderStatus::Cancelled => u8::MAX,
    }
}

/// Order intake and the administrative order surface.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    catalog: CatalogService,
    coupons: CouponService,
    pricing: PricingEngine,
    reconciliation: Arc<ReconciliationService>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        catalog: CatalogService,
        coupons: CouponService,
        pricing: PricingEngine,
        reconciliation: Arc<ReconciliationService>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db_pool,
            catalog,
            coupons,
            pricing,
            reconciliation,
            event_sender,
        }
    }

    /// Turns a cart into a persisted unpaid order.
    ///
    /// Totals are recomputed server-side from the catalog; client-submitted
    /// prices are never trusted. Stock is not decremented and the coupon is
    /// not redeemed here: both wait for confirmed payment, because the order
    /// may never be paid.
    #[instrument(skip(self, address, lines, coupon_code), fields(user_id = %user_id, lines = lines.len()))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        address: ShippingAddress,
        lines: Vec<CartLine>,
        coupon_code: Option<String>,
        payment_method: PaymentMethod,
    ) -> Result<PlacedOrder, ServiceError> {
        address.validate()?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let products = self.catalog.get_products(&ids).await?;
        let priced = self.pricing.price_lines(&lines, &products)?;

        let coupon = match coupon_code.as_deref() {
            Some(code) => self.coupons.evaluate(code, priced.items_price).await?,
            None => CouponDecision::none(),
        };

        let quote = self.pricing.finalize(priced, coupon.discount);

        let shipping_address = serde_json::to_value(&address).map_err(|e| {
            ServiceError::InternalError(format!("Failed to serialize shipping address: {}", e))
        })?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        let order_number = unique_reference(
            &txn,
            order::Column::OrderNumber,
            ORDER_NUMBER_PREFIX,
            ORDER_NUMBER_LEN,
        )
        .await?;
        let tracking_number = unique_reference(
            &txn,
            order::Column::TrackingNumber,
            TRACKING_NUMBER_PREFIX,
            TRACKING_NUMBER_LEN,
        )
        .await?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            tracking_number: Set(tracking_number),
            user_id: Set(user_id),
            shipping_address: Set(shipping_address),
            payment_method: Set(payment_method),
            items_price: Set(quote.items_price),
            shipping_price: Set(quote.shipping_price),
            tax_price: Set(quote.tax_price),
            discount_amount: Set(quote.discount_amount),
            total_price: Set(quote.total_price),
            coupon_code: Set(coupon.code.clone()),
            is_paid: Set(false),
            paid_at: Set(None),
            payment_status: Set("pending".to_string()),
            transaction_id: Set(None),
            payer_email: Set(None),
            is_delivered: Set(false),
            delivered_at: Set(None),
            status: Set(OrderStatus::Processing),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(quote.lines.len());
        for line in &quote.lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                image_url: Set(line.image_url.clone()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to insert order item");
                ServiceError::DatabaseError(e)
            })?;
            items.push(item);
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order_id,
            order_number = %order_model.order_number,
            total = %order_model.total_price,
            "Order created"
        );

        if let Err(e) = self.event_sender.send(Event::OrderCreated(order_id)).await {
            warn!(error = %e, order_id = %order_id, "Failed to send order created event");
        }

        Ok(PlacedOrder {
            order: order_model,
            items,
            coupon,
        })
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?;
        Ok(order)
    }

    pub async fn get_order_with_items(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(order::Model, Vec<order_item::Model>)>, ServiceError> {
        let mut results = OrderEntity::find_by_id(order_id)
            .find_with_related(OrderItemEntity)
            .all(&*self.db_pool)
            .await?;
        Ok(results.pop())
    }

    pub async fn get_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<(order::Model, Vec<order_item::Model>)>, ServiceError> {
        let mut results = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .find_with_related(OrderItemEntity)
            .all(&*self.db_pool)
            .await?;
        Ok(results.pop())
    }

    /// Lists orders newest-first, optionally restricted to one customer.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        user_filter: Option<Uuid>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(user_id) = user_filter {
            query = query.filter(order::Column::UserId.eq(user_id));
        }

        let paginator = query.paginate(&*self.db_pool, per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.max(1) - 1).await?;

        Ok((orders, total))
    }

    /// Moves an order forward through the fulfilment statuses.
    ///
    /// Forward-only: regressions are rejected, and the delivered/cancelled
    /// transitions have their own endpoints because they carry side effects.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        match new_status {
            OrderStatus::Cancelled => {
                return Err(ServiceError::InvalidStatus(
                    "Use the cancellation endpoint to cancel an order".to_string(),
                ))
            }
            OrderStatus::Delivered => {
                return Err(ServiceError::InvalidStatus(
                    "Use the delivery confirmation endpoint to mark delivery".to_string(),
                ))
            }
            _ => {}
        }

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to start status update transaction");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidStatus(
                "Cancelled orders cannot change status".to_string(),
            ));
        }
        if status_rank(new_status) <= status_rank(order.status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot move order from {} to {}",
                order.status, new_status
            )));
        }

        let old_status = order.status;
        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());
        active.version = Set(version + 1);

        let updated = active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to update order status");
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit status update");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, old_status = %old_status, new_status = %new_status, "Order status updated");

        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await
        {
            warn!(error = %e, order_id = %order_id, "Failed to send status changed event");
        }

        Ok(updated)
    }

    /// Cancels an undelivered order. Idempotent: cancelling twice is a no-op.
    /// A paid order keeps `is_paid = true`; refunds are a separate concern.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if order.is_delivered {
            return Err(ServiceError::InvalidStatus(
                "Delivered orders cannot be cancelled".to_string(),
            ));
        }
        if order.status == OrderStatus::Cancelled {
            info!(order_id = %order_id, "Order already cancelled");
            return Ok(order);
        }

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled);
        active.updated_at = Set(Utc::now());
        active.version = Set(version + 1);

        let updated = active.update(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to cancel order");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, "Order cancelled");

        if let Err(e) = self.event_sender.send(Event::OrderCancelled(order_id)).await {
            warn!(error = %e, order_id = %order_id, "Failed to send order cancelled event");
        }

        Ok(updated)
    }

    /// Marks an order delivered.
    ///
    /// For cash on delivery this is also the payment confirmation, so the
    /// reconciliation finalizer runs first; its gate keeps the stock and
    /// coupon side effects exactly-once even if delivery is marked twice.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidStatus(
                "Cancelled orders cannot be delivered".to_string(),
            ));
        }
        if order.is_delivered {
            info!(order_id = %order_id, "Order already delivered");
            return Ok(order);
        }

        if !order.is_paid {
            match order.payment_method {
                PaymentMethod::Cod => {
                    let outcome = self.reconciliation.confirm_cod(&order).await?;
                    info!(order_id = %order_id, outcome = ?outcome, "Cash on delivery confirmed");
                }
                _ => {
                    return Err(ServiceError::InvalidStatus(
                        "Order has not been paid".to_string(),
                    ))
                }
            }
        }

        let old_status = order.status;
        let now = Utc::now();

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::IsDelivered, Expr::value(true))
            .col_expr(order::Column::DeliveredAt, Expr::value(now))
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Delivered))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::IsDelivered.eq(false))
            .exec(&*self.db_pool)
            .await?;

        let delivered = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if updated.rows_affected == 0 {
            info!(order_id = %order_id, "Order already delivered");
            return Ok(delivered);
        }

        info!(order_id = %order_id, "Order delivered");

        if let Err(e) = self.event_sender.send(Event::OrderDelivered(order_id)).await {
            warn!(error = %e, order_id = %order_id, "Failed to send order delivered event");
        }
        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: OrderStatus::Delivered.to_string(),
            })
            .await
        {
            warn!(error = %e, order_id = %order_id, "Failed to send status changed event");
        }

        Ok(delivered)
    }
}
