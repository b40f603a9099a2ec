use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::EntityTrait;
use serde_json::Value;
use storefront_api::{
    config::AppConfig,
    db,
    entities::{coupon, order, product},
    events::{self, EventSender},
    handlers::AppServices,
    rate_limiter::{RateLimitConfig, RateLimiter},
    services::catalog::NewProduct,
    services::coupons::NewCoupon,
    services::reconciliation::sign_payload,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret-32-chars-long";

/// Helper harness for spinning up an application backed by a throwaway
/// SQLite database file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    db_path: PathBuf,
    _event_task: tokio::task::JoinHandle<()>,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Construct a test application, letting the caller adjust configuration
/// before the service graph is wired (gateway URLs, rate limits, secrets).
pub async fn spawn_app_with<F>(mutate: F) -> TestApp
where
    F: FnOnce(&mut AppConfig),
{
    let db_path = std::env::temp_dir().join(format!(
        "storefront_test_{}.db",
        Uuid::new_v4().simple()
    ));

    let mut cfg = AppConfig::new(
        format!("sqlite://{}?mode=rwc", db_path.display()),
        "127.0.0.1".to_string(),
        0,
        "test".to_string(),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.payment_webhook_secret = Some(TEST_WEBHOOK_SECRET.to_string());
    // High enough that only the dedicated rate limit test ever trips it.
    cfg.checkout_rate_limit_requests = 1_000;
    mutate(&mut cfg);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .expect("failed to create test database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations in tests");

    let db_arc = Arc::new(pool);
    let (event_tx, event_rx) = mpsc::channel(256);
    let event_sender = EventSender::new(event_tx);
    let event_task = tokio::spawn(events::process_events(event_rx));

    let services = AppServices::new(db_arc.clone(), &cfg, event_sender.clone())
        .expect("failed to build services for tests");
    let limiter = RateLimiter::new(RateLimitConfig::from_config(&cfg));

    let state = AppState {
        db: db_arc,
        config: cfg,
        event_sender,
        services,
        limiter,
    };

    let router = Router::new()
        .nest("/api/v1", storefront_api::api_v1_routes(state.clone()))
        .with_state(state.clone());

    TestApp {
        router,
        state,
        db_path,
        _event_task: event_task,
    }
}

impl TestApp {
    /// Send a request against the router with arbitrary extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Request as an ordinary authenticated customer.
    pub async fn as_user(
        &self,
        user_id: Uuid,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let id = user_id.to_string();
        self.request(method, uri, body, &[("x-user-id", id.as_str())])
            .await
    }

    /// Request as an admin user.
    pub async fn as_admin(
        &self,
        user_id: Uuid,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let id = user_id.to_string();
        self.request(
            method,
            uri,
            body,
            &[("x-user-id", id.as_str()), ("x-user-roles", "admin")],
        )
        .await
    }

    /// Post a provider webhook with a fresh, valid signature.
    pub async fn signed_webhook(&self, provider: &str, payload: &Value) -> axum::response::Response {
        let body = serde_json::to_vec(payload).expect("failed to serialize webhook payload");
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(TEST_WEBHOOK_SECRET, timestamp, &body);
        let ts = timestamp.to_string();
        self.raw_webhook(
            provider,
            body,
            &[("x-timestamp", ts.as_str()), ("x-signature", signature.as_str())],
        )
        .await
    }

    /// Post a provider webhook with caller-controlled headers and body.
    pub async fn raw_webhook(
        &self,
        provider: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/v1/payments/webhook/{provider}"))
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let slug = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>();
        self.state
            .services
            .catalog
            .create_product(NewProduct {
                name: name.to_string(),
                slug: format!("{}-{}", slug, Uuid::new_v4().simple()),
                price,
                stock,
                image_url: None,
            })
            .await
            .expect("seed product for tests")
    }

    pub async fn seed_coupon(&self, new_coupon: NewCoupon) -> coupon::Model {
        self.state
            .services
            .coupons
            .create_coupon(new_coupon)
            .await
            .expect("seed coupon for tests")
    }

    pub async fn order_row(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("load order row")
            .expect("order row missing")
    }

    pub async fn product_row(&self, product_id: Uuid) -> product::Model {
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product row")
            .expect("product row missing")
    }

    pub async fn coupon_row(&self, coupon_id: Uuid) -> coupon::Model {
        coupon::Entity::find_by_id(coupon_id)
            .one(&*self.state.db)
            .await
            .expect("load coupon row")
            .expect("coupon row missing")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        let _ = std::fs::remove_file(&self.db_path);
        // SQLite leaves WAL sidecar files next to the database.
        for suffix in ["-wal", "-shm"] {
            let mut side = self.db_path.clone().into_os_string();
            side.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
    }
}

/// Read a JSON response body.
pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body was not valid JSON")
}

/// Extract the order id from a successful create-order response.
pub fn order_id_from(body: &Value) -> Uuid {
    body["data"]["id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("response carried no order id")
}

/// Money fields serialize as decimal strings; tolerate bare numbers too.
pub fn money(value: &Value) -> Decimal {
    use std::str::FromStr;
    match value {
        Value::String(s) => Decimal::from_str(s).expect("unparseable decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("unparseable decimal number"),
        other => panic!("expected a monetary value, got {other:?}"),
    }
}
