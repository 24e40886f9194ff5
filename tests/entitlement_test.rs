//! Entitlement grant, revoke and resolution tests.

mod common;

use common::TestApp;
use serde_json::json;
use uuid::Uuid;

async fn purchase(app: &TestApp, tenant: Uuid, sku: &str, key: &str) -> Uuid {
    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": sku, "idempotency_key": key }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    Uuid::parse_str(body["license"]["license_id"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn grant_and_resolve_round_trip() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let license_id = purchase(&app, tenant, "PRO-MONTHLY", "buy-1").await;

    let response = app
        .post_json(
            &format!("/billing/licenses/{}/entitlements", license_id),
            tenant,
            &json!({ "key": "work-orders", "limit_units": 500 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app.get("/billing/entitlements", tenant).await;
    let resolved: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0]["key"], "work-orders");
    assert_eq!(resolved[0]["limit_units"], 500);
    assert_eq!(resolved[0]["is_unlimited"], false);
}

#[tokio::test]
async fn grant_requires_limit_xor_unlimited() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let license_id = purchase(&app, tenant, "PRO-MONTHLY", "buy-xor").await;

    let response = app
        .post_json(
            &format!("/billing/licenses/{}/entitlements", license_id),
            tenant,
            &json!({ "key": "work-orders", "limit_units": 500, "is_unlimited": true }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .post_json(
            &format!("/billing/licenses/{}/entitlements", license_id),
            tenant,
            &json!({ "key": "work-orders" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn unlimited_grant_wins_over_any_numeric_limit() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let license_id = purchase(&app, tenant, "PRO-MONTHLY", "buy-unl").await;

    // Second license inserted directly: purchase would cancel the first.
    let second_license = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tenant_licenses (license_id, tenant_id, sku_id, sku_code, term, status,
            amount_cents, currency, current_period_start, current_period_end, created_utc)
        SELECT $1, tenant_id, sku_id, sku_code, term, 'active', amount_cents, currency,
            current_period_start, current_period_end, created_utc + interval '1 second'
        FROM tenant_licenses WHERE license_id = $2
        "#,
    )
    .bind(second_license)
    .bind(license_id)
    .execute(app.db.pool())
    .await
    .expect("Failed to insert second license");

    app.post_json(
        &format!("/billing/licenses/{}/entitlements", license_id),
        tenant,
        &json!({ "key": "work-orders", "is_unlimited": true }),
    )
    .await;
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", second_license),
        tenant,
        &json!({ "key": "work-orders", "limit_units": 1000000 }),
    )
    .await;

    let response = app.get("/billing/entitlements", tenant).await;
    let resolved: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0]["is_unlimited"], true);
    assert!(resolved[0]["limit_units"].is_null());
}

#[tokio::test]
async fn larger_limit_wins_and_ties_keep_the_first_license() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let first_license = purchase(&app, tenant, "PRO-MONTHLY", "buy-two").await;

    let second_license = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tenant_licenses (license_id, tenant_id, sku_id, sku_code, term, status,
            amount_cents, currency, current_period_start, current_period_end, created_utc)
        SELECT $1, tenant_id, sku_id, sku_code, term, 'active', amount_cents, currency,
            current_period_start, current_period_end, created_utc + interval '1 second'
        FROM tenant_licenses WHERE license_id = $2
        "#,
    )
    .bind(second_license)
    .bind(first_license)
    .execute(app.db.pool())
    .await
    .expect("Failed to insert second license");

    // Larger limit displaces the smaller one.
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", first_license),
        tenant,
        &json!({ "key": "work-orders", "limit_units": 3 }),
    )
    .await;
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", second_license),
        tenant,
        &json!({ "key": "work-orders", "limit_units": 5 }),
    )
    .await;
    // Equal limits keep the earlier license.
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", first_license),
        tenant,
        &json!({ "key": "seats", "limit_units": 10 }),
    )
    .await;
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", second_license),
        tenant,
        &json!({ "key": "seats", "limit_units": 10 }),
    )
    .await;

    let response = app.get("/billing/entitlements", tenant).await;
    let resolved: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert_eq!(resolved.len(), 2);

    let seats = resolved.iter().find(|e| e["key"] == "seats").unwrap();
    assert_eq!(seats["license_id"], first_license.to_string());
    let work_orders = resolved.iter().find(|e| e["key"] == "work-orders").unwrap();
    assert_eq!(work_orders["limit_units"], 5);
    assert_eq!(work_orders["license_id"], second_license.to_string());
}

#[tokio::test]
async fn revoked_entitlement_disappears_from_resolution() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let license_id = purchase(&app, tenant, "PRO-MONTHLY", "buy-rev").await;

    app.post_json(
        &format!("/billing/licenses/{}/entitlements", license_id),
        tenant,
        &json!({ "key": "work-orders", "limit_units": 500 }),
    )
    .await;

    let response = app
        .delete(
            &format!("/billing/licenses/{}/entitlements/work-orders", license_id),
            tenant,
        )
        .await;
    assert_eq!(response.status().as_u16(), 204);

    let response = app.get("/billing/entitlements", tenant).await;
    let resolved: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert!(resolved.is_empty());

    // Revoking again is a 404.
    let response = app
        .delete(
            &format!("/billing/licenses/{}/entitlements/work-orders", license_id),
            tenant,
        )
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn foreign_tenant_cannot_grant_on_a_license() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let owner = Uuid::new_v4();
    let license_id = purchase(&app, owner, "PRO-MONTHLY", "buy-own").await;

    let response = app
        .post_json(
            &format!("/billing/licenses/{}/entitlements", license_id),
            Uuid::new_v4(),
            &json!({ "key": "work-orders", "limit_units": 500 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn grant_and_revoke_leave_audit_events() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();
    let license_id = purchase(&app, tenant, "PRO-MONTHLY", "buy-audit").await;

    let response = app
        .post_json(
            &format!("/billing/licenses/{}/entitlements", license_id),
            tenant,
            &json!({ "key": "work-orders", "limit_units": 500 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .delete(
            &format!("/billing/licenses/{}/entitlements/work-orders", license_id),
            tenant,
        )
        .await;
    assert_eq!(response.status().as_u16(), 204);

    let granted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM billing_audit_events WHERE tenant_id = $1 AND event_type = 'ENTITLEMENT_GRANTED'",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to count audit events");
    assert_eq!(granted, 1);

    let revoked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM billing_audit_events WHERE tenant_id = $1 AND event_type = 'ENTITLEMENT_REVOKED'",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to count audit events");
    assert_eq!(revoked, 1);
}
