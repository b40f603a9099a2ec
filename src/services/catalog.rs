use crate::{
    db::DbPool,
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct NewProduct {
    #[validate(length(min = 1, max = 255, message = "Product name is required"))]
    pub name: String,
    #[validate(length(min = 1, max = 255, message = "Product slug is required"))]
    pub slug: String,
    pub price: Decimal,
    #[validate(range(min = 0, message = "Stock cannot be negative"))]
    pub stock: i32,
    pub image_url: Option<String>,
}

/// Result of a conditional stock decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockDecrement {
    /// The full quantity was subtracted.
    Applied,
    /// Stock was short; it has been clamped to zero instead of going negative.
    Clamped { available: i32 },
}

/// Read side of the product catalog plus the one write the checkout flow
/// needs: the atomic stock decrement applied at payment confirmation.
#[derive(Clone)]
pub struct CatalogService {
    db_pool: Arc<DbPool>,
}

impl CatalogService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Fetches all referenced products in a single query. Missing ids are
    /// simply absent from the result; callers decide how to report them.
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn get_products(&self, ids: &[Uuid]) -> Result<Vec<product::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let products = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db_pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load products for pricing");
                ServiceError::DatabaseError(e)
            })?;

        Ok(products)
    }

    /// Inserts a product. Used by fixtures and operational tooling; the
    /// storefront itself only reads the catalog.
    #[instrument(skip(self, new_product), fields(slug = %new_product.slug))]
    pub async fn create_product(
        &self,
        new_product: NewProduct,
    ) -> Result<product::Model, ServiceError> {
        new_product.validate()?;

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(new_product.name),
            slug: Set(new_product.slug),
            price: Set(new_product.price),
            stock: Set(new_product.stock),
            image_url: Set(new_product.image_url),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let product = model.insert(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, "Failed to insert product");
            ServiceError::DatabaseError(e)
        })?;

        info!(product_id = %product.id, "Product created");
        Ok(product)
    }

    /// Atomically subtracts `quantity` from the product's stock.
    ///
    /// The subtraction only applies while `stock >= quantity`, so concurrent
    /// confirmations can never drive stock negative. On shortfall the stock
    /// is clamped to zero and the caller is told how much was actually there.
    /// Runs on the caller's connection so it can join the payment transaction.
    pub async fn decrement_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<StockDecrement, ServiceError> {
        let now = Utc::now();

        let applied = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(now))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if applied.rows_affected > 0 {
            return Ok(StockDecrement::Applied);
        }

        let available = ProductEntity::find_by_id(product_id)
            .one(conn)
            .await?
            .map(|p| p.stock)
            .unwrap_or(0);

        // Clamp to zero, guarded so a concurrent restock is not wiped out.
        ProductEntity::update_many()
            .col_expr(product::Column::Stock, Expr::value(0))
            .col_expr(product::Column::UpdatedAt, Expr::value(now))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.lt(quantity))
            .exec(conn)
            .await?;

        warn!(
            product_id = %product_id,
            requested = quantity,
            available = available,
            "Stock shortfall during decrement, clamped to zero"
        );

        Ok(StockDecrement::Clamped { available })
    }
}
