pub mod orders;
pub mod payments;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::gateways::GatewayRegistry;
use crate::services::{
    CatalogService, CouponService, NotificationDispatcher, OrderService, PricingEngine,
    ReconciliationService, WebhookVerifier,
};
use crate::services::pricing::PricingSettings;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: CatalogService,
    pub coupons: CouponService,
    pub orders: OrderService,
    pub reconciliation: Arc<ReconciliationService>,
    pub gateways: Arc<GatewayRegistry>,
}

impl AppServices {
    /// Wires the full service graph from configuration.
    ///
    /// Fails fast on malformed pricing knobs or an unbuildable HTTP client
    /// so a bad deployment dies at startup instead of at checkout time.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let catalog = CatalogService::new(db_pool.clone());
        let coupons = CouponService::new(db_pool.clone());
        let pricing = PricingEngine::new(PricingSettings::from_config(config)?);
        let notifications = NotificationDispatcher::from_config(config)?;
        let verifier = WebhookVerifier::new(
            config.payment_webhook_secret.clone(),
            config.webhook_tolerance(),
        );

        let reconciliation = Arc::new(ReconciliationService::new(
            db_pool.clone(),
            catalog.clone(),
            coupons.clone(),
            notifications,
            verifier,
            event_sender.clone(),
        ));
        let orders = OrderService::new(
            db_pool,
            catalog.clone(),
            coupons.clone(),
            pricing,
            reconciliation.clone(),
            event_sender,
        );
        let gateways = Arc::new(GatewayRegistry::from_config(config)?);

        Ok(Self {
            catalog,
            coupons,
            orders,
            reconciliation,
            gateways,
        })
    }
}
