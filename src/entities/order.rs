use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Order aggregate. Monetary snapshots are immutable after creation;
/// `is_paid` is monotonic and only ever set by the payment finalizer.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Human-facing display id, "ORD-XXXXXXXX"
    pub order_number: String,
    /// Shipment tracking number, "TRK-XXXXXXXXXXXX"
    pub tracking_number: String,
    pub user_id: Uuid,
    #[sea_orm(column_type = "Json")]
    #[schema(value_type = Object)]
    pub shipping_address: Json,
    pub payment_method: PaymentMethod,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub items_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_price: Decimal,
    /// Coupon actually applied, normalized upper-case
    pub coupon_code: Option<String>,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    /// Provider status token: "pending" until reconciled, "paid" on
    /// success, otherwise the failure token as received
    pub payment_status: String,
    pub transaction_id: Option<String>,
    pub payer_email: Option<String>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    /// Cash on delivery: no gateway session, confirmed by delivery marking
    #[sea_orm(string_value = "cod")]
    Cod,
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "jazzcash")]
    Jazzcash,
    #[sea_orm(string_value = "easypaisa")]
    Easypaisa,
    #[sea_orm(string_value = "safepay")]
    Safepay,
    #[sea_orm(string_value = "stripe")]
    Stripe,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "out_for_delivery")]
    OutForDelivery,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Shipping address persisted as the order's JSON snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 200))]
    pub full_name: String,
    #[validate(length(min = 1, max = 500))]
    pub address_line: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 1, max = 100))]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 30))]
    pub phone: Option<String>,
}
