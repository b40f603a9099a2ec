mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{order_id_from, read_json, spawn_app, spawn_app_with, TestApp, TEST_WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use std::time::Duration;
use storefront_api::entities::coupon::CouponKind;
use storefront_api::entities::product;
use storefront_api::services::coupons::NewCoupon;
use storefront_api::services::reconciliation::sign_payload;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn place_order(
    app: &TestApp,
    product_id: Uuid,
    quantity: i32,
    coupon: Option<&str>,
    payment_method: &str,
) -> Uuid {
    let mut payload = json!({
        "shipping_address": {
            "full_name": "Bilal Ahmed",
            "address_line": "Flat 7, Clifton Block 2",
            "city": "Karachi",
            "postal_code": "75600",
            "country": "Pakistan",
        },
        "items": [{"product_id": product_id, "quantity": quantity}],
        "payment_method": payment_method,
    });
    if let Some(code) = coupon {
        payload["coupon_code"] = json!(code);
    }

    let response = app
        .as_user(Uuid::new_v4(), Method::POST, "/api/v1/orders", Some(payload))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    order_id_from(&read_json(response).await)
}

fn success_payload(order_id: Uuid) -> Value {
    json!({
        "reference": order_id,
        "status": "succeeded",
        "transaction_id": "txn_0001",
        "payer_email": "buyer@example.com",
    })
}

fn failure_payload(order_id: Uuid, token: &str) -> Value {
    json!({
        "reference": order_id,
        "status": token,
    })
}

#[tokio::test]
async fn a_verified_success_webhook_finalizes_the_order() {
    let app = spawn_app().await;
    let product = app.seed_product("Mechanical Keyboard", dec!(30), 5).await;
    let coupon = app
        .seed_coupon(NewCoupon {
            code: "SAVE10".into(),
            kind: CouponKind::Percent,
            value: dec!(10),
            min_order: None,
            max_uses: None,
            expires_at: None,
        })
        .await;
    let order_id = place_order(&app, product.id, 2, Some("SAVE10"), "card").await;

    let response = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!({"received": true}));

    let row = app.order_row(order_id).await;
    assert!(row.is_paid);
    assert!(row.paid_at.is_some());
    assert_eq!(row.payment_status, "paid");
    assert_eq!(row.transaction_id.as_deref(), Some("txn_0001"));
    assert_eq!(row.payer_email.as_deref(), Some("buyer@example.com"));

    assert_eq!(app.product_row(product.id).await.stock, 3);
    assert_eq!(app.coupon_row(coupon.id).await.used_count, 1);
}

#[tokio::test]
async fn duplicate_webhooks_apply_side_effects_once() {
    let app = spawn_app().await;
    let product = app.seed_product("Wireless Mouse", dec!(25), 5).await;
    let coupon = app
        .seed_coupon(NewCoupon {
            code: "FIVER".into(),
            kind: CouponKind::Flat,
            value: dec!(5),
            min_order: None,
            max_uses: None,
            expires_at: None,
        })
        .await;
    let order_id = place_order(&app, product.id, 2, Some("FIVER"), "card").await;

    let first = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let replay = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(replay.status(), StatusCode::OK);

    assert!(app.order_row(order_id).await.is_paid);
    assert_eq!(app.product_row(product.id).await.stock, 3);
    assert_eq!(app.coupon_row(coupon.id).await.used_count, 1);
}

#[tokio::test]
async fn racing_webhooks_finalize_exactly_once() {
    let app = spawn_app().await;
    let product = app.seed_product("USB Hub", dec!(20), 10).await;
    let order_id = place_order(&app, product.id, 4, None, "card").await;

    let payload = success_payload(order_id);
    let (a, b) = tokio::join!(
        app.signed_webhook("card", &payload),
        app.signed_webhook("card", &payload),
    );
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    assert!(app.order_row(order_id).await.is_paid);
    assert_eq!(app.product_row(product.id).await.stock, 6);
}

#[tokio::test]
async fn failed_attempts_record_status_and_allow_retry() {
    let app = spawn_app().await;
    let product = app.seed_product("Desk Lamp", dec!(35), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    let declined = app
        .signed_webhook("card", &failure_payload(order_id, "declined"))
        .await;
    assert_eq!(declined.status(), StatusCode::OK);

    let row = app.order_row(order_id).await;
    assert!(!row.is_paid);
    assert_eq!(row.payment_status, "declined");
    assert_eq!(app.product_row(product.id).await.stock, 5);

    // The customer retries and the second attempt succeeds.
    let retry = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(retry.status(), StatusCode::OK);

    let row = app.order_row(order_id).await;
    assert!(row.is_paid);
    assert_eq!(row.payment_status, "paid");
    assert_eq!(app.product_row(product.id).await.stock, 4);
}

#[tokio::test]
async fn success_is_never_downgraded_by_late_failures() {
    let app = spawn_app().await;
    let product = app.seed_product("Office Chair", dec!(120), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    let paid = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(paid.status(), StatusCode::OK);

    let late_failure = app
        .signed_webhook("card", &failure_payload(order_id, "failed"))
        .await;
    assert_eq!(late_failure.status(), StatusCode::OK);

    let row = app.order_row(order_id).await;
    assert!(row.is_paid);
    assert_eq!(row.payment_status, "paid");
    assert_eq!(app.product_row(product.id).await.stock, 4);
}

#[tokio::test]
async fn unknown_status_tokens_fail_closed() {
    let app = spawn_app().await;
    let product = app.seed_product("Bookends", dec!(14), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    // A token outside the success vocabulary is a failure, however long.
    let sprawling = "x".repeat(80);
    let response = app
        .signed_webhook("card", &failure_payload(order_id, &sprawling))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let row = app.order_row(order_id).await;
    assert!(!row.is_paid);
    assert_eq!(row.payment_status.len(), 64);

    let response = app
        .signed_webhook("card", &failure_payload(order_id, "  Pending-Review "))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order_row(order_id).await.payment_status, "pending-review");
}

#[tokio::test]
async fn webhooks_require_a_valid_signature() {
    let app = spawn_app().await;
    let product = app.seed_product("Yoga Mat", dec!(25), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    let body = serde_json::to_vec(&success_payload(order_id)).unwrap();

    // No signature headers at all.
    let bare = app.raw_webhook("card", body.clone(), &[]).await;
    assert_eq!(bare.status(), StatusCode::UNAUTHORIZED);

    // Signed with the wrong secret.
    let timestamp = Utc::now().timestamp();
    let forged = sign_payload("not-the-secret", timestamp, &body);
    let ts = timestamp.to_string();
    let wrong = app
        .raw_webhook(
            "card",
            body,
            &[("x-timestamp", ts.as_str()), ("x-signature", forged.as_str())],
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let row = app.order_row(order_id).await;
    assert!(!row.is_paid);
    assert_eq!(row.payment_status, "pending");
    assert_eq!(app.product_row(product.id).await.stock, 5);
}

#[tokio::test]
async fn stale_webhook_timestamps_are_rejected() {
    let app = spawn_app().await;
    let product = app.seed_product("Blender", dec!(65), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    let body = serde_json::to_vec(&success_payload(order_id)).unwrap();
    let stale = Utc::now().timestamp() - 3600;
    let signature = sign_payload(TEST_WEBHOOK_SECRET, stale, &body);
    let ts = stale.to_string();

    let response = app
        .raw_webhook(
            "card",
            body,
            &[("x-timestamp", ts.as_str()), ("x-signature", signature.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!app.order_row(order_id).await.is_paid);
}

#[tokio::test]
async fn stripe_events_are_verified_and_normalized() {
    let app = spawn_app().await;
    let product = app.seed_product("Espresso Grinder", dec!(95), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "stripe").await;

    let payload = json!({
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": "cs_live_1",
                "client_reference_id": order_id,
                "payment_status": "paid",
                "payment_intent": "pi_777",
                "customer_details": {"email": "buyer@example.com"},
            }
        }
    });
    let body = serde_json::to_vec(&payload).unwrap();
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload(TEST_WEBHOOK_SECRET, timestamp, &body);
    let header = format!("t={timestamp},v1={signature}");

    let response = app
        .raw_webhook("stripe", body, &[("stripe-signature", header.as_str())])
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let row = app.order_row(order_id).await;
    assert!(row.is_paid);
    assert_eq!(row.transaction_id.as_deref(), Some("pi_777"));
    assert_eq!(row.payer_email.as_deref(), Some("buyer@example.com"));
    assert_eq!(app.product_row(product.id).await.stock, 4);
}

#[tokio::test]
async fn webhooks_for_unknown_orders_are_acknowledged() {
    let app = spawn_app().await;

    let response = app
        .signed_webhook("card", &success_payload(Uuid::new_v4()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!({"received": true}));
}

#[tokio::test]
async fn malformed_webhook_payloads_are_rejected() {
    let app = spawn_app().await;
    let product = app.seed_product("Steel Tumbler", dec!(18), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    // Correctly signed, but not JSON.
    let body = b"not json".to_vec();
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload(TEST_WEBHOOK_SECRET, timestamp, &body);
    let ts = timestamp.to_string();
    let junk = app
        .raw_webhook(
            "card",
            body,
            &[("x-timestamp", ts.as_str()), ("x-signature", signature.as_str())],
        )
        .await;
    assert_eq!(junk.status(), StatusCode::BAD_REQUEST);

    // Valid JSON with no status token.
    let no_status = app
        .signed_webhook("card", &json!({"reference": order_id}))
        .await;
    assert_eq!(no_status.status(), StatusCode::BAD_REQUEST);

    // An unknown provider segment is a 404, not an acknowledgement.
    let unknown = app
        .signed_webhook("paypal", &success_payload(order_id))
        .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    assert!(!app.order_row(order_id).await.is_paid);
}

#[tokio::test]
async fn redirect_callbacks_choose_the_landing_page() {
    let app = spawn_app().await;
    let product = app.seed_product("Telescope", dec!(210), 5).await;

    // Successful return: reconciled and sent to the success page.
    let paid_order = place_order(&app, product.id, 1, None, "card").await;
    let response = app
        .request(
            Method::GET,
            &format!(
                "/api/v1/payments/callback/card?order_id={paid_order}&status=succeeded&session_id=sess_9"
            ),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers().get("location").unwrap().to_str().unwrap();
    assert_eq!(
        location,
        format!("http://localhost:3000/payment/success/{paid_order}")
    );

    let row = app.order_row(paid_order).await;
    assert!(row.is_paid);
    assert_eq!(row.transaction_id.as_deref(), Some("sess_9"));

    // Cancelled return: recorded and sent to the failure page.
    let failed_order = place_order(&app, product.id, 1, None, "card").await;
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/callback/card?order_id={failed_order}&status=cancelled"),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers().get("location").unwrap().to_str().unwrap();
    assert_eq!(
        location,
        format!("http://localhost:3000/payment/failed/{failed_order}")
    );

    let row = app.order_row(failed_order).await;
    assert!(!row.is_paid);
    assert_eq!(row.payment_status, "cancelled");
}

#[tokio::test]
async fn mangled_redirects_still_land_on_the_failure_page() {
    let app = spawn_app().await;

    // No parameters at all.
    let bare = app
        .request(Method::GET, "/api/v1/payments/callback/card", None, &[])
        .await;
    assert_eq!(bare.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        bare.headers().get("location").unwrap().to_str().unwrap(),
        "http://localhost:3000/payment/failed"
    );

    // Unknown provider.
    let unknown_provider = app
        .request(
            Method::GET,
            &format!(
                "/api/v1/payments/callback/paypal?order_id={}&status=succeeded",
                Uuid::new_v4()
            ),
            None,
            &[],
        )
        .await;
    assert_eq!(unknown_provider.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        unknown_provider
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap(),
        "http://localhost:3000/payment/failed"
    );

    // Known provider, unknown order: the redirect never claims success.
    let ghost = Uuid::new_v4();
    let unknown_order = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/callback/card?order_id={ghost}&status=succeeded"),
            None,
            &[],
        )
        .await;
    assert_eq!(unknown_order.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        unknown_order
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap(),
        format!("http://localhost:3000/payment/failed/{ghost}")
    );
}

#[tokio::test]
async fn shortfall_at_finalization_clamps_stock_to_zero() {
    let app = spawn_app().await;
    let product = app.seed_product("Festival Lantern", dec!(30), 5).await;
    let order_id = place_order(&app, product.id, 3, None, "card").await;

    // Stock shrinks between checkout and payment confirmation.
    product::Entity::update_many()
        .col_expr(product::Column::Stock, Expr::value(1))
        .filter(product::Column::Id.eq(product.id))
        .exec(&*app.state.db)
        .await
        .unwrap();

    let response = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(response.status(), StatusCode::OK);

    // The payment stands; stock floors at zero instead of going negative.
    assert!(app.order_row(order_id).await.is_paid);
    assert_eq!(app.product_row(product.id).await.stock, 0);
}

#[tokio::test]
async fn coupon_redemption_waits_for_confirmed_payment() {
    let app = spawn_app().await;
    let product = app.seed_product("Tea Sampler", dec!(40), 10).await;
    let coupon = app
        .seed_coupon(NewCoupon {
            code: "ONCE".into(),
            kind: CouponKind::Flat,
            value: dec!(10),
            min_order: None,
            max_uses: Some(1),
            expires_at: None,
        })
        .await;

    let order_id = place_order(&app, product.id, 1, Some("ONCE"), "card").await;
    assert_eq!(app.coupon_row(coupon.id).await.used_count, 0);

    let response = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.coupon_row(coupon.id).await.used_count, 1);

    // The next shopper finds the coupon exhausted; checkout still succeeds.
    let response = app
        .as_user(
            Uuid::new_v4(),
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "shipping_address": {
                    "full_name": "Sana Tariq",
                    "address_line": "22 Mall Road",
                    "city": "Lahore",
                    "postal_code": "54000",
                    "country": "Pakistan",
                },
                "items": [{"product_id": product.id, "quantity": 1}],
                "coupon_code": "ONCE",
                "payment_method": "card",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = read_json(response).await;
    assert_eq!(body["message"], json!("Coupon has reached its usage limit"));
    assert!(body["data"]["coupon_code"].is_null());
}

#[tokio::test]
async fn finalization_notifies_the_messaging_service() {
    let messaging = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/order-paid"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&messaging)
        .await;

    let app = spawn_app_with(|cfg| {
        cfg.notification_order_url = Some(format!("{}/hooks/order-paid", messaging.uri()));
        cfg.notification_signing_secret = Some("notify-secret".to_string());
    })
    .await;
    let product = app.seed_product("Hand-Knotted Rug", dec!(150), 5).await;
    let order_id = place_order(&app, product.id, 1, None, "card").await;

    let response = app.signed_webhook("card", &success_payload(order_id)).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Dispatch runs on a detached task after the commit.
    let mut received = Vec::new();
    for _ in 0..50 {
        received = messaging.received_requests().await.unwrap_or_default();
        if !received.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(received.len(), 1, "messaging endpoint was never called");

    let request = &received[0];
    let snapshot: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(snapshot["order_id"], json!(order_id.to_string()));
    assert_eq!(snapshot["payment_method"], json!("card"));
    assert_eq!(snapshot["items"].as_array().map(Vec::len), Some(1));

    // The payload is signed the same way inbound webhooks are verified.
    let timestamp: i64 = request
        .headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("notification carried no timestamp");
    let signature = request
        .headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .expect("notification carried no signature");
    assert_eq!(
        signature,
        sign_payload("notify-secret", timestamp, &request.body)
    );
}
