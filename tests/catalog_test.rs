//! Catalog endpoint tests.

mod common;

use common::TestApp;
use uuid::Uuid;

#[tokio::test]
async fn skus_are_listed_cheapest_first() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("PRO-ANNUAL", "annual", 0, 49900).await;
    app.seed_sku("BASIC-MONTHLY", "monthly", 14, 1900).await;
    app.seed_sku("PRO-MONTHLY", "monthly", 14, 4900).await;

    let response = app.get("/billing/catalog", Uuid::new_v4()).await;
    assert!(response.status().is_success());

    let skus: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    let codes: Vec<&str> = skus.iter().map(|s| s["code"].as_str().unwrap()).collect();
    assert_eq!(codes, vec!["BASIC-MONTHLY", "PRO-MONTHLY", "PRO-ANNUAL"]);
}

#[tokio::test]
async fn inactive_skus_are_hidden_by_default() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    app.seed_sku("LEGACY", "monthly", 0, 900).await;
    sqlx::query("UPDATE catalog_skus SET is_active = FALSE WHERE code = 'LEGACY'")
        .execute(app.db.pool())
        .await
        .expect("Failed to deactivate SKU");
    app.seed_sku("CURRENT", "monthly", 0, 1900).await;

    let response = app.get("/billing/catalog", Uuid::new_v4()).await;
    let skus: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert_eq!(skus.len(), 1);
    assert_eq!(skus[0]["code"], "CURRENT");

    let response = app
        .get("/billing/catalog?include_inactive=true", Uuid::new_v4())
        .await;
    let skus: Vec<serde_json::Value> = response.json().await.expect("Invalid JSON");
    assert_eq!(skus.len(), 2);
}
