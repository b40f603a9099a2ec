use crate::{config::AppConfig, entities::product, errors::ServiceError};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use uuid::Uuid;

/// Rounds a monetary amount to two decimal places, half away from zero.
/// Every pricing step rounds through this so intermediate drift cannot
/// accumulate into the grand total.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Checkout pricing knobs, converted once from configuration.
#[derive(Debug, Clone)]
pub struct PricingSettings {
    pub tax_rate: Decimal,
    pub shipping_flat_fee: Decimal,
    pub free_shipping_threshold: Decimal,
}

impl PricingSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            tax_rate: decimal_setting(config.tax_rate, "tax_rate")?,
            shipping_flat_fee: decimal_setting(config.shipping_flat_fee, "shipping_flat_fee")?,
            free_shipping_threshold: decimal_setting(
                config.free_shipping_threshold,
                "free_shipping_threshold",
            )?,
        })
    }
}

fn decimal_setting(value: f64, name: &str) -> Result<Decimal, ServiceError> {
    Decimal::try_from(value).map_err(|_| {
        ServiceError::InternalError(format!("Configured {} is not a representable amount", name))
    })
}

/// One client-submitted cart line, already shape-validated.
#[derive(Debug, Clone, Copy)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// A cart line with its catalog snapshot attached. The snapshot is what gets
/// persisted on the order; later catalog edits never touch placed orders.
#[derive(Debug, Clone)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub image_url: Option<String>,
}

/// Snapshot-priced cart before shipping/tax/discount are applied. The
/// subtotal is exposed so the coupon evaluator can run against it.
#[derive(Debug, Clone)]
pub struct PricedCart {
    pub lines: Vec<PricedLine>,
    pub items_price: Decimal,
}

/// Fully itemized order totals.
#[derive(Debug, Clone)]
pub struct Quote {
    pub lines: Vec<PricedLine>,
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub discount_amount: Decimal,
    pub total_price: Decimal,
}

/// Pure pricing over a catalog snapshot. No side effects, no stock writes.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    settings: PricingSettings,
}

impl PricingEngine {
    pub fn new(settings: PricingSettings) -> Self {
        Self { settings }
    }

    /// Resolves cart lines against the catalog snapshot and computes the
    /// items subtotal.
    ///
    /// All unresolvable product ids are reported together so the client can
    /// prune exactly the offending lines. Inactive products count as
    /// unavailable. Stock is checked per product across the whole cart, so
    /// duplicate lines cannot sneak past the limit.
    pub fn price_lines(
        &self,
        lines: &[CartLine],
        products: &[product::Model],
    ) -> Result<PricedCart, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        for line in lines {
            if line.quantity < 1 {
                return Err(ServiceError::ValidationError(
                    "Quantity must be at least 1".to_string(),
                ));
            }
        }

        let by_id: HashMap<Uuid, &product::Model> = products
            .iter()
            .filter(|p| p.is_active)
            .map(|p| (p.id, p))
            .collect();

        let mut missing = Vec::new();
        for line in lines {
            if !by_id.contains_key(&line.product_id) && !missing.contains(&line.product_id) {
                missing.push(line.product_id);
            }
        }
        if !missing.is_empty() {
            return Err(ServiceError::InvalidProduct { missing });
        }

        let mut requested_per_product: HashMap<Uuid, i32> = HashMap::new();
        for line in lines {
            *requested_per_product.entry(line.product_id).or_insert(0) += line.quantity;
        }
        for line in lines {
            let product = by_id[&line.product_id];
            let requested = requested_per_product[&line.product_id];
            if requested > product.stock {
                return Err(ServiceError::InsufficientStock {
                    product: product.name.clone(),
                    requested,
                    available: product.stock,
                });
            }
        }

        let mut priced = Vec::with_capacity(lines.len());
        let mut items_price = Decimal::ZERO;
        for line in lines {
            let product = by_id[&line.product_id];
            items_price += round_money(product.price * Decimal::from(line.quantity));
            priced.push(PricedLine {
                product_id: product.id,
                name: product.name.clone(),
                quantity: line.quantity,
                unit_price: product.price,
                image_url: product.image_url.clone(),
            });
        }

        Ok(PricedCart {
            lines: priced,
            items_price: round_money(items_price),
        })
    }

    /// Applies shipping, tax, and the already-capped discount to a priced
    /// cart. The grand total floors at zero.
    pub fn finalize(&self, priced: PricedCart, discount: Decimal) -> Quote {
        let items_price = priced.items_price;

        let shipping_price = if items_price >= self.settings.free_shipping_threshold {
            Decimal::ZERO
        } else {
            round_money(self.settings.shipping_flat_fee)
        };

        let tax_price = round_money(items_price * self.settings.tax_rate);
        let discount_amount = round_money(discount.max(Decimal::ZERO));

        let total_price =
            round_money(items_price + shipping_price + tax_price - discount_amount)
                .max(Decimal::ZERO);

        Quote {
            lines: priced.lines,
            items_price,
            shipping_price,
            tax_price,
            discount_amount,
            total_price,
        }
    }
}
