use crate::{
    db::DbPool,
    entities::coupon::{self, CouponKind, Entity as CouponEntity},
    errors::ServiceError,
    services::pricing::round_money,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Why a coupon code was not applied. Advisory only: checkout proceeds
/// without the discount instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponRejection {
    UnknownCode,
    Inactive,
    Expired,
    UsageExhausted,
    BelowMinimum { min_order: Decimal },
}

impl CouponRejection {
    pub fn message(&self) -> String {
        match self {
            Self::UnknownCode => "Coupon code was not recognized".to_string(),
            Self::Inactive => "Coupon is no longer active".to_string(),
            Self::Expired => "Coupon has expired".to_string(),
            Self::UsageExhausted => "Coupon has reached its usage limit".to_string(),
            Self::BelowMinimum { min_order } => {
                format!("Order subtotal is below the coupon minimum of {}", min_order)
            }
        }
    }
}

/// Outcome of evaluating a coupon code against a subtotal.
///
/// `code` carries the normalized code actually applied, so the order snapshot
/// stays self-consistent even if the coupon row is later edited or deleted.
#[derive(Debug, Clone)]
pub struct CouponDecision {
    pub code: Option<String>,
    pub discount: Decimal,
    pub rejection: Option<CouponRejection>,
}

impl CouponDecision {
    /// No coupon requested.
    pub fn none() -> Self {
        Self {
            code: None,
            discount: Decimal::ZERO,
            rejection: None,
        }
    }

    fn rejected(rejection: CouponRejection) -> Self {
        Self {
            code: None,
            discount: Decimal::ZERO,
            rejection: Some(rejection),
        }
    }

    pub fn applied(&self) -> bool {
        self.code.is_some()
    }
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Pure validity-and-discount decision over a loaded coupon row.
///
/// Percent values cap at 100%, flat values cap at the subtotal: a discount
/// never exceeds what is being discounted.
pub fn decide(
    coupon: &coupon::Model,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::Inactive);
    }
    if let Some(expires_at) = coupon.expires_at {
        if now > expires_at {
            return Err(CouponRejection::Expired);
        }
    }
    if let Some(max_uses) = coupon.max_uses {
        if coupon.used_count >= max_uses {
            return Err(CouponRejection::UsageExhausted);
        }
    }
    if let Some(min_order) = coupon.min_order {
        if subtotal < min_order {
            return Err(CouponRejection::BelowMinimum { min_order });
        }
    }

    let discount = match coupon.kind {
        CouponKind::Percent => {
            let percent = coupon.value.min(dec!(100)).max(Decimal::ZERO);
            round_money(subtotal * percent / dec!(100))
        }
        CouponKind::Flat => round_money(coupon.value.min(subtotal).max(Decimal::ZERO)),
    };

    Ok(discount)
}

#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct NewCoupon {
    #[validate(length(min = 1, max = 64, message = "Coupon code is required"))]
    pub code: String,
    pub kind: CouponKind,
    pub value: Decimal,
    pub min_order: Option<Decimal>,
    pub max_uses: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CouponService {
    db_pool: Arc<DbPool>,
}

impl CouponService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Evaluates a client-submitted code against the current subtotal.
    ///
    /// Never fails the checkout: an unusable coupon yields a zero discount
    /// plus an advisory rejection for the response message.
    #[instrument(skip(self), fields(subtotal = %subtotal))]
    pub async fn evaluate(
        &self,
        raw_code: &str,
        subtotal: Decimal,
    ) -> Result<CouponDecision, ServiceError> {
        let code = normalize_code(raw_code);
        if code.is_empty() {
            return Ok(CouponDecision::none());
        }

        let coupon = CouponEntity::find()
            .filter(coupon::Column::Code.eq(&code))
            .one(&*self.db_pool)
            .await
            .map_err(|e| {
                error!(error = %e, code = %code, "Failed to look up coupon");
                ServiceError::DatabaseError(e)
            })?;

        let Some(coupon) = coupon else {
            info!(code = %code, "Coupon code not found, proceeding without discount");
            return Ok(CouponDecision::rejected(CouponRejection::UnknownCode));
        };

        match decide(&coupon, subtotal, Utc::now()) {
            Ok(discount) => Ok(CouponDecision {
                code: Some(code),
                discount,
                rejection: None,
            }),
            Err(rejection) => {
                info!(code = %code, reason = %rejection.message(), "Coupon rejected, proceeding without discount");
                Ok(CouponDecision::rejected(rejection))
            }
        }
    }

    /// Increments the coupon's usage counter by exactly one.
    ///
    /// Called by the payment finalizer, on its transaction, once per order.
    /// Redemption is tied to confirmed payment, never to order creation.
    pub async fn redeem<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
    ) -> Result<(), ServiceError> {
        let updated = CouponEntity::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(code))
            .exec(conn)
            .await?;

        if updated.rows_affected == 0 {
            warn!(code = %code, "Coupon disappeared before redemption, usage not counted");
        }

        Ok(())
    }

    /// Inserts a coupon with a normalized code. Fixture/operational helper.
    #[instrument(skip(self, new_coupon), fields(code = %new_coupon.code))]
    pub async fn create_coupon(
        &self,
        new_coupon: NewCoupon,
    ) -> Result<coupon::Model, ServiceError> {
        new_coupon.validate()?;

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(normalize_code(&new_coupon.code)),
            kind: Set(new_coupon.kind),
            value: Set(new_coupon.value),
            min_order: Set(new_coupon.min_order),
            max_uses: Set(new_coupon.max_uses),
            used_count: Set(0),
            expires_at: Set(new_coupon.expires_at),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let coupon = model.insert(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, "Failed to insert coupon");
            ServiceError::DatabaseError(e)
        })?;

        info!(coupon_id = %coupon.id, code = %coupon.code, "Coupon created");
        Ok(coupon)
    }
}
