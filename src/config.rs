use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::gateways::{
    card::CardConfig, easypaisa::EasypaisaConfig, jazzcash::JazzCashConfig,
    safepay::SafepayConfig, stripe::StripeConfig,
};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default = "default_false_bool")]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    // ========== Pricing Configuration ==========
    /// Tax rate applied to the item subtotal (0.0 - 1.0)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: f64,

    /// Flat shipping fee charged below the free-shipping threshold
    #[serde(default = "default_shipping_flat_fee")]
    #[validate(custom = "validate_money_amount")]
    pub shipping_flat_fee: f64,

    /// Item subtotal at or above which shipping is free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_money_amount")]
    pub free_shipping_threshold: f64,

    /// Currency code passed to payment providers
    #[serde(default = "default_currency")]
    pub currency: String,

    // ========== URL Configuration ==========
    /// Externally reachable base URL of this service (provider callbacks)
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Storefront base URL (browser landing pages after payment)
    #[serde(default = "default_frontend_base_url")]
    pub frontend_base_url: String,

    // ========== Checkout Rate Limiting ==========
    /// Order-creation requests allowed per client per window
    #[serde(default = "default_checkout_rate_limit_requests")]
    pub checkout_rate_limit_requests: u32,

    /// Checkout rate limit window in seconds
    #[serde(default = "default_checkout_rate_limit_window_secs")]
    pub checkout_rate_limit_window_secs: u64,

    // ========== Events ==========
    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    // ========== Inbound Webhook Verification ==========
    /// Shared secret for verifying payment webhook signatures
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Allowed clock skew for webhook timestamps (seconds)
    #[serde(default)]
    pub payment_webhook_tolerance_secs: Option<u64>,

    // ========== Notification Endpoints ==========
    /// Endpoint receiving customer order-confirmation payloads
    #[serde(default)]
    pub notification_order_url: Option<String>,

    /// Endpoint receiving admin new-payment alerts
    #[serde(default)]
    pub notification_admin_url: Option<String>,

    /// Secret used to sign outbound notification payloads
    #[serde(default)]
    pub notification_signing_secret: Option<String>,

    // ========== Gateway Credentials ==========
    /// Card processor API key
    #[serde(default)]
    pub card_api_key: Option<String>,
    /// Card processor API base URL
    #[serde(default)]
    pub card_base_url: Option<String>,

    /// JazzCash merchant ID
    #[serde(default)]
    pub jazzcash_merchant_id: Option<String>,
    /// JazzCash merchant password
    #[serde(default)]
    pub jazzcash_password: Option<String>,
    /// JazzCash integrity salt (request hashing)
    #[serde(default)]
    pub jazzcash_integrity_salt: Option<String>,
    /// JazzCash API base URL
    #[serde(default)]
    pub jazzcash_base_url: Option<String>,

    /// Easypaisa store ID
    #[serde(default)]
    pub easypaisa_store_id: Option<String>,
    /// Easypaisa hash key
    #[serde(default)]
    pub easypaisa_hash_key: Option<String>,
    /// Easypaisa API base URL
    #[serde(default)]
    pub easypaisa_base_url: Option<String>,

    /// Safepay API key
    #[serde(default)]
    pub safepay_api_key: Option<String>,
    /// Safepay API base URL
    #[serde(default)]
    pub safepay_base_url: Option<String>,

    /// Stripe secret key
    #[serde(default)]
    pub stripe_secret_key: Option<String>,
    /// Stripe API base URL (overridable for tests)
    #[serde(default)]
    pub stripe_base_url: Option<String>,
}

impl AppConfig {
    /// Creates a configuration with defaults, suitable for tests and tooling
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            tax_rate: default_tax_rate(),
            shipping_flat_fee: default_shipping_flat_fee(),
            free_shipping_threshold: default_free_shipping_threshold(),
            currency: default_currency(),
            public_base_url: default_public_base_url(),
            frontend_base_url: default_frontend_base_url(),
            checkout_rate_limit_requests: default_checkout_rate_limit_requests(),
            checkout_rate_limit_window_secs: default_checkout_rate_limit_window_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: None,
            notification_order_url: None,
            notification_admin_url: None,
            notification_signing_secret: None,
            card_api_key: None,
            card_base_url: None,
            jazzcash_merchant_id: None,
            jazzcash_password: None,
            jazzcash_integrity_salt: None,
            jazzcash_base_url: None,
            easypaisa_store_id: None,
            easypaisa_hash_key: None,
            easypaisa_base_url: None,
            safepay_api_key: None,
            safepay_base_url: None,
            stripe_secret_key: None,
            stripe_base_url: None,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("test")
    }

    /// Permissive CORS is acceptable in development or with an explicit override
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn webhook_tolerance(&self) -> Duration {
        Duration::from_secs(
            self.payment_webhook_tolerance_secs
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
        )
    }

    /// URL the provider redirects the shopper back to after payment
    pub fn provider_return_url(&self, provider: &str) -> String {
        format!(
            "{}/api/v1/payments/callback/{}",
            self.public_base_url.trim_end_matches('/'),
            provider
        )
    }

    /// Assembles the card processor configuration if credentials are present
    pub fn build_card_config(&self) -> Option<CardConfig> {
        Some(CardConfig {
            api_key: self.card_api_key.clone()?,
            base_url: self.card_base_url.clone()?,
            currency: self.currency.clone(),
            return_url: self.provider_return_url("card"),
        })
    }

    pub fn build_jazzcash_config(&self) -> Option<JazzCashConfig> {
        Some(JazzCashConfig {
            merchant_id: self.jazzcash_merchant_id.clone()?,
            password: self.jazzcash_password.clone()?,
            integrity_salt: self.jazzcash_integrity_salt.clone()?,
            base_url: self.jazzcash_base_url.clone()?,
            currency: self.currency.clone(),
            return_url: self.provider_return_url("jazzcash"),
        })
    }

    pub fn build_easypaisa_config(&self) -> Option<EasypaisaConfig> {
        Some(EasypaisaConfig {
            store_id: self.easypaisa_store_id.clone()?,
            hash_key: self.easypaisa_hash_key.clone()?,
            base_url: self.easypaisa_base_url.clone()?,
            return_url: self.provider_return_url("easypaisa"),
        })
    }

    pub fn build_safepay_config(&self) -> Option<SafepayConfig> {
        Some(SafepayConfig {
            api_key: self.safepay_api_key.clone()?,
            base_url: self.safepay_base_url.clone()?,
            currency: self.currency.clone(),
            return_url: self.provider_return_url("safepay"),
        })
    }

    pub fn build_stripe_config(&self) -> Option<StripeConfig> {
        Some(StripeConfig {
            secret_key: self.stripe_secret_key.clone()?,
            base_url: self
                .stripe_base_url
                .clone()
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            currency: self.currency.clone(),
            return_url: self.provider_return_url("stripe"),
        })
    }

    /// Constraints that depend on more than one field
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development()
            && self.cors_allowed_origins.is_none()
            && !self.cors_allow_any_origin
        {
            let mut err = ValidationError::new("cors_allowed_origins");
            err.message = Some(
                "Non-development environments must configure CORS origins or explicitly allow any origin"
                    .into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_false_bool() -> bool {
    false
}
fn default_tax_rate() -> f64 {
    0.1
}
fn default_shipping_flat_fee() -> f64 {
    10.0
}
fn default_free_shipping_threshold() -> f64 {
    100.0
}
fn default_currency() -> String {
    "PKR".to_string()
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_frontend_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_checkout_rate_limit_requests() -> u32 {
    30
}
fn default_checkout_rate_limit_window_secs() -> u64 {
    60
}
fn default_event_channel_capacity() -> usize {
    1024
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate > 1.0 {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_money_amount(amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() || amount < 0.0 {
        let mut err = ValidationError::new("money_amount");
        err.message = Some("Monetary configuration values must be finite and non-negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading error: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://storefront.db?mode=memory".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn defaults_cover_pricing_knobs() {
        let cfg = base_config();
        assert_eq!(cfg.tax_rate, 0.1);
        assert_eq!(cfg.shipping_flat_fee, 10.0);
        assert_eq!(cfg.free_shipping_threshold, 100.0);
        assert_eq!(cfg.currency, "PKR");
        assert_eq!(cfg.checkout_rate_limit_requests, 30);
        assert_eq!(cfg.checkout_rate_limit_window_secs, 60);
    }

    #[test]
    fn webhook_tolerance_defaults_to_five_minutes() {
        let cfg = base_config();
        assert_eq!(cfg.webhook_tolerance(), Duration::from_secs(300));
    }

    #[test]
    fn gateway_config_requires_all_credentials() {
        let mut cfg = base_config();
        assert!(cfg.build_jazzcash_config().is_none());

        cfg.jazzcash_merchant_id = Some("MC10001".into());
        cfg.jazzcash_password = Some("secret".into());
        assert!(cfg.build_jazzcash_config().is_none());

        cfg.jazzcash_integrity_salt = Some("salt".into());
        cfg.jazzcash_base_url = Some("https://sandbox.jazzcash.com.pk".into());
        let gateway_cfg = cfg.build_jazzcash_config().unwrap();
        assert_eq!(gateway_cfg.merchant_id, "MC10001");
        assert!(gateway_cfg.return_url.ends_with("/api/v1/payments/callback/jazzcash"));
    }

    #[test]
    fn stripe_base_url_has_production_default() {
        let mut cfg = base_config();
        cfg.stripe_secret_key = Some("sk_test_123".into());
        let stripe = cfg.build_stripe_config().unwrap();
        assert_eq!(stripe.base_url, "https://api.stripe.com");
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_allows_override_flag() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_allows_permissive_by_default() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn tax_rate_bounds_are_enforced() {
        assert!(validate_tax_rate(0.0).is_ok());
        assert!(validate_tax_rate(0.17).is_ok());
        assert!(validate_tax_rate(1.0).is_ok());
        assert!(validate_tax_rate(-0.1).is_err());
        assert!(validate_tax_rate(1.5).is_err());
        assert!(validate_tax_rate(f64::NAN).is_err());
    }
}
