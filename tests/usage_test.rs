//! Usage metering tests.

mod common;

use common::TestApp;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn usage_accumulates_monotonically() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": 3 }),
        )
        .await;
    assert!(response.status().is_success());
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["used_units"], 3);

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": 4 }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["used_units"], 7);
}

#[tokio::test]
async fn negative_quantity_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": -1 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(app.count_rows("usage_meters", Some(tenant)).await, 0);
}

#[tokio::test]
async fn zero_quantity_still_touches_last_recorded_at() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/usage",
        tenant,
        &json!({ "meter_key": "documents", "quantity": 5 }),
    )
    .await;
    let before: serde_json::Value = app
        .get("/billing/usage-meters", tenant)
        .await
        .json()
        .await
        .expect("Invalid JSON");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": 0 }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["used_units"], 5);
    assert_ne!(meter["last_recorded_at"], before[0]["last_recorded_at"]);
}

#[tokio::test]
async fn meter_binds_to_current_license_once() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("BASIC-MONTHLY", "monthly", 0, 1900).await;
    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": "BASIC-MONTHLY", "idempotency_key": "buy-basic" }),
        )
        .await;
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    let first_license = body["license"]["license_id"].clone();

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": 1, "attach_license": true }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["license_id"], first_license);

    // The subscription changes; the binding does not.
    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-pro" }),
    )
    .await;

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "documents", "quantity": 1, "attach_license": true }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["license_id"], first_license);
}

#[tokio::test]
async fn omitting_attach_license_binds_by_default() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("BASIC-MONTHLY", "monthly", 0, 1900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": "BASIC-MONTHLY", "idempotency_key": "buy-default-bind" }),
        )
        .await;
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    let license_id = body["license"]["license_id"].clone();

    // No attach_license field at all: first touch binds to the current
    // subscription.
    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "api-calls", "quantity": 10 }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(meter["license_id"], license_id);
}

#[tokio::test]
async fn opting_out_of_attachment_stays_unbound() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("BASIC-MONTHLY", "monthly", 0, 1900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "BASIC-MONTHLY", "idempotency_key": "buy-no-bind" }),
    )
    .await;

    let response = app
        .post_json(
            "/billing/usage",
            tenant,
            &json!({ "meter_key": "api-calls", "quantity": 10, "attach_license": false }),
        )
        .await;
    let meter: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert!(meter["license_id"].is_null());
}
