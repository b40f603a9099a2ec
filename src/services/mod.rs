// Core checkout services
pub mod catalog;
pub mod coupons;
pub mod orders;
pub mod pricing;

// Payment reconciliation
pub mod reconciliation;

// Outbound side effects
pub mod notifications;

pub use catalog::CatalogService;
pub use coupons::CouponService;
pub use notifications::NotificationDispatcher;
pub use orders::OrderService;
pub use pricing::PricingEngine;
pub use reconciliation::{ReconciliationService, WebhookVerifier};
