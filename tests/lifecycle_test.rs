//! Subscription lifecycle tests: trials, purchase, cancellation and the
//! billing sweep.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn purchase_creates_active_license_with_charge_and_invoice() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-1" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");

    assert_eq!(body["license"]["status"], "active");
    assert_eq!(body["license"]["amount_cents"], 4900);
    assert_eq!(body["ledger_entry"]["entry_type"], "charge");
    assert_eq!(body["ledger_entry"]["amount_cents"], 4900);
    assert_eq!(body["invoice"]["status"], "pending");
    assert_eq!(body["invoice"]["amount_cents"], 4900);
    assert!(body["invoice"]["paid_at"].is_null());

    let current = app.get("/billing/subscription", tenant).await;
    assert!(current.status().is_success());
}

#[tokio::test]
async fn zero_amount_purchase_issues_paid_invoice() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("FREE-MONTHLY", "monthly", 0, 0).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": "FREE-MONTHLY", "idempotency_key": "buy-free" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(body["invoice"]["status"], "paid");
    assert!(!body["invoice"]["paid_at"].is_null());
}

#[tokio::test]
async fn purchase_with_stale_expected_price_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({
                "sku_code": "PRO-MONTHLY",
                "idempotency_key": "buy-stale",
                "expected_amount_cents": 3900,
                "currency": "USD",
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(app.count_rows("tenant_licenses", Some(tenant)).await, 0);
}

#[tokio::test]
async fn purchase_supersedes_existing_license() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("BASIC-MONTHLY", "monthly", 0, 1900).await;
    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "BASIC-MONTHLY", "idempotency_key": "buy-basic" }),
    )
    .await;
    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-pro" }),
    )
    .await;

    let current = app.get("/billing/subscription", tenant).await;
    let body: serde_json::Value = current.json().await.expect("Invalid JSON");
    assert_eq!(body["sku_code"], "PRO-MONTHLY");

    let cancelled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tenant_licenses WHERE tenant_id = $1 AND status = 'cancelled'",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to count");
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn trial_requires_sku_with_trial_days() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("NO-TRIAL", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/trial",
            tenant,
            &json!({ "sku_code": "NO-TRIAL", "idempotency_key": "trial-1" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn trial_is_consumable_once_per_sku() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    let first = app
        .post_json(
            "/billing/trial",
            tenant,
            &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-a" }),
        )
        .await;
    assert_eq!(first.status().as_u16(), 201);

    // Fresh key, same SKU: the trial was already consumed.
    let second = app
        .post_json(
            "/billing/trial",
            tenant,
            &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-b" }),
        )
        .await;
    assert_eq!(second.status().as_u16(), 400);

    // Same key replays the original trial instead.
    let replay = app
        .post_json(
            "/billing/trial",
            tenant,
            &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-a" }),
        )
        .await;
    assert_eq!(replay.status().as_u16(), 200);
}

#[tokio::test]
async fn trial_creates_no_ledger_entry() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/trial",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-ledger" }),
    )
    .await;

    assert_eq!(app.count_rows("ledger_entries", Some(tenant)).await, 0);
    assert_eq!(app.count_rows("billing_invoices", Some(tenant)).await, 0);
}

#[tokio::test]
async fn sweep_expires_trial_without_payment_method() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/trial",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-exp" }),
    )
    .await;

    let as_of = Utc::now() + Duration::days(15);
    let response = app
        .post_json(
            "/billing/sweep",
            tenant,
            &json!({ "as_of": as_of.to_rfc3339() }),
        )
        .await;
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["trials_expired"], 1);
    assert_eq!(summary["trials_converted"], 0);

    let (status, read_only): (String, bool) = sqlx::query_as(
        "SELECT status, is_read_only FROM tenant_licenses WHERE tenant_id = $1",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to load license");
    assert_eq!(status, "expired");
    // Still inside the 7-day grace window.
    assert!(!read_only);

    // Past grace: the lock-out flips is_read_only exactly once.
    let as_of = Utc::now() + Duration::days(30);
    let response = app
        .post_json(
            "/billing/sweep",
            tenant,
            &json!({ "as_of": as_of.to_rfc3339() }),
        )
        .await;
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["licenses_locked"], 1);

    let response = app
        .post_json(
            "/billing/sweep",
            tenant,
            &json!({ "as_of": as_of.to_rfc3339() }),
        )
        .await;
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["licenses_locked"], 0);
}

#[tokio::test]
async fn sweep_converts_trial_when_payment_method_exists() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/trial",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "trial-conv" }),
    )
    .await;
    app.post_json(
        "/billing/payment-methods",
        tenant,
        &json!({
            "provider": "stripe",
            "external_ref": "pm_123",
            "is_default": true,
            "idempotency_key": "pm-1",
        }),
    )
    .await;

    let as_of = Utc::now() + Duration::days(15);
    let response = app
        .post_json(
            "/billing/sweep",
            tenant,
            &json!({ "as_of": as_of.to_rfc3339() }),
        )
        .await;
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["trials_converted"], 1);

    let (status, period_start, trial_ends_at): (
        String,
        chrono::DateTime<Utc>,
        chrono::DateTime<Utc>,
    ) = sqlx::query_as(
        "SELECT status, current_period_start, trial_ends_at FROM tenant_licenses WHERE tenant_id = $1",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to load license");
    assert_eq!(status, "active");
    // The paid period starts where the trial ended, not at sweep time.
    assert_eq!(period_start, trial_ends_at);
}

#[tokio::test]
async fn sweep_rolls_overdue_periods_without_drift() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-roll" }),
    )
    .await;

    let (old_start, old_end): (chrono::DateTime<Utc>, chrono::DateTime<Utc>) = sqlx::query_as(
        "SELECT current_period_start, current_period_end FROM tenant_licenses WHERE tenant_id = $1",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to load license");

    // Two full periods behind: rollover must advance by whole terms.
    let as_of = old_end + Duration::days(35);
    let response = app
        .post_json(
            "/billing/sweep",
            tenant,
            &json!({ "as_of": as_of.to_rfc3339() }),
        )
        .await;
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["periods_rolled"], 1);

    let (new_start, new_end): (chrono::DateTime<Utc>, chrono::DateTime<Utc>) = sqlx::query_as(
        "SELECT current_period_start, current_period_end FROM tenant_licenses WHERE tenant_id = $1",
    )
    .bind(tenant)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to load license");

    assert_eq!(new_start, old_start + Duration::days(60));
    assert_eq!(new_end, old_end + Duration::days(60));
    assert!(new_end > as_of);
}

#[tokio::test]
async fn cancel_ends_the_current_license() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-cancel" }),
    )
    .await;

    let response = app
        .post_json(
            "/billing/cancel",
            tenant,
            &json!({ "idempotency_key": "cancel-1" }),
        )
        .await;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(body["status"], "cancelled");
    assert!(!body["canceled_at"].is_null());

    // Nothing left to cancel under a fresh key.
    let response = app
        .post_json(
            "/billing/cancel",
            tenant,
            &json!({ "idempotency_key": "cancel-2" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn cancel_retry_without_effective_date_replays() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    app.post_json(
        "/billing/purchase",
        tenant,
        &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-retry" }),
    )
    .await;

    let body = json!({ "idempotency_key": "cancel-retry" });
    let first = app.post_json("/billing/cancel", tenant, &body).await;
    assert!(first.status().is_success());
    let first: serde_json::Value = first.json().await.expect("Invalid JSON");

    // The retry arrives later, so the server resolves a different "now";
    // the stored payload hash must not depend on it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let retry = app.post_json("/billing/cancel", tenant, &body).await;
    assert_eq!(retry.status().as_u16(), 200);
    let retry: serde_json::Value = retry.json().await.expect("Invalid JSON");

    assert_eq!(retry["license_id"], first["license_id"]);
    assert_eq!(retry["canceled_at"], first["canceled_at"]);
    assert_eq!(retry["status"], "cancelled");
}

#[tokio::test]
async fn sweep_alerts_on_meters_near_their_limit() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-MONTHLY", "monthly", 0, 4900).await;
    let tenant = Uuid::new_v4();

    let response = app
        .post_json(
            "/billing/purchase",
            tenant,
            &json!({ "sku_code": "PRO-MONTHLY", "idempotency_key": "buy-alert" }),
        )
        .await;
    let body: serde_json::Value = response.json().await.expect("Invalid JSON");
    let license_id = body["license"]["license_id"].as_str().unwrap().to_string();

    // Storage granted in gigabytes, metered in megabytes: 850 MB of a
    // 1 GB limit is ~0.83, past the 0.8 warning threshold.
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", license_id),
        tenant,
        &json!({ "key": "storage", "limit_units": 1, "unit": "gigabytes" }),
    )
    .await;
    app.post_json(
        "/billing/usage",
        tenant,
        &json!({ "meter_key": "storage", "quantity": 850, "unit": "megabytes" }),
    )
    .await;

    // A second meter well under its limit stays quiet.
    app.post_json(
        &format!("/billing/licenses/{}/entitlements", license_id),
        tenant,
        &json!({ "key": "documents", "limit_units": 500 }),
    )
    .await;
    app.post_json(
        "/billing/usage",
        tenant,
        &json!({ "meter_key": "documents", "quantity": 100 }),
    )
    .await;

    let response = app
        .post_json("/billing/sweep", tenant, &json!({}))
        .await;
    assert!(response.status().is_success());
    let summary: serde_json::Value = response.json().await.expect("Invalid JSON");
    assert_eq!(summary["usage_alerts"], 1);

    let alerts: Vec<(String,)> = sqlx::query_as(
        "SELECT detail->>'meter_key' FROM billing_audit_events
         WHERE tenant_id = $1 AND event_type = 'USAGE_THRESHOLD'",
    )
    .bind(tenant)
    .fetch_all(app.db.pool())
    .await
    .expect("Failed to load audit events");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, "storage");
}
