//! End-to-end HTTP surface test: boots the application on an ephemeral port
//! against the in-memory store and drives the review workflow with a real
//! client.

mod common;

use common::{alias, date, receipt, transaction};
use matching_service::config::{DatabaseConfig, DecayConfig, MatchingConfig, MatchingTuning};
use matching_service::services::{MatchStore, MemoryStore};
use matching_service::startup::Application;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

struct TestApp {
    address: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    user_id: Uuid,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

fn test_config() -> MatchingConfig {
    MatchingConfig {
        common: service_core::config::Config { port: 0 },
        service_name: "matching-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 2,
            min_connections: 1,
        },
        matching: MatchingTuning::default(),
        decay: DecayConfig {
            enabled: false,
            ..DecayConfig::default()
        },
    }
}

/// Spawn the application on port 0 with a fresh in-memory store.
async fn spawn_app() -> TestApp {
    common::init_tracing();

    let store = Arc::new(MemoryStore::new());
    let app = Application::build_with_store(
        test_config(),
        store.clone() as Arc<dyn MatchStore>,
        None,
    )
    .await
    .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    TestApp {
        address,
        client: reqwest::Client::new(),
        store,
        user_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("invalid json");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn requests_without_a_user_header_are_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(app.url("/matching/run"))
        .json(&json!({}))
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn manual_match_with_both_targets_is_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(app.url("/matches/manual"))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({
            "receipt_id": Uuid::new_v4(),
            "transaction_id": Uuid::new_v4(),
            "group_id": Uuid::new_v4(),
        }))
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn full_review_workflow_over_http() {
    let app = spawn_app().await;
    let r = receipt(app.user_id, "425.00", date(2025, 1, 10), "Delta Airlines");
    let t = transaction(app.user_id, "425.00", date(2025, 1, 10), "DELTA AIR 0062334156983");
    app.store.insert_receipt(r.clone()).await;
    app.store.insert_transaction(t.clone()).await;
    app.store
        .insert_alias(alias(app.user_id, "DELTA AIR", "Delta Airlines"))
        .await;

    // Candidates are visible before anything is proposed.
    let response = app
        .client
        .get(app.url(&format!("/receipts/{}/candidates", r.receipt_id)))
        .header("x-user-id", app.user_id.to_string())
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let candidates: Value = response.json().await.expect("invalid json");
    assert_eq!(candidates.as_array().map(Vec::len), Some(1));
    assert_eq!(candidates[0]["score"], 100);
    assert_eq!(candidates[0]["candidate_type"], "transaction");

    // Batch run proposes the pairing.
    let response = app
        .client
        .post(app.url("/matching/run"))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let summary: Value = response.json().await.expect("invalid json");
    assert_eq!(summary["processed"], 1);
    assert_eq!(summary["proposed"], 1);
    assert_eq!(summary["ambiguous"], 0);

    let proposed = app.store.matches_for_receipt(r.receipt_id).await.remove(0);

    // Confirm with a stale version first: conflict semantics over HTTP.
    let response = app
        .client
        .post(app.url(&format!("/matches/{}/confirm", proposed.match_id)))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({"version": proposed.version + 1}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 409);

    // Now with the version actually observed.
    let response = app
        .client
        .post(app.url(&format!("/matches/{}/confirm", proposed.match_id)))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({"version": proposed.version, "gl_code": "6100"}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let confirmed: Value = response.json().await.expect("invalid json");
    assert_eq!(confirmed["state"], "confirmed");
    assert_eq!(confirmed["is_manual"], false);

    // Confirming again is an invalid state, also 409.
    let response = app
        .client
        .post(app.url(&format!("/matches/{}/confirm", proposed.match_id)))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({"version": confirmed["version"]}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 409);

    // Stats reflect the confirmed pairing.
    let response = app
        .client
        .get(app.url("/matching/stats"))
        .header("x-user-id", app.user_id.to_string())
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let stats: Value = response.json().await.expect("invalid json");
    assert_eq!(stats["matched_count"], 1);
    assert_eq!(stats["proposed_count"], 0);
    assert_eq!(stats["auto_match_rate"], 1.0);

    // Unmatch releases both sides and reports no drift for a transaction.
    let version = confirmed["version"].as_i64().expect("version");
    let response = app
        .client
        .post(app.url(&format!("/matches/{}/unmatch", proposed.match_id)))
        .header("x-user-id", app.user_id.to_string())
        .json(&json!({"version": version}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let outcome: Value = response.json().await.expect("invalid json");
    assert_eq!(outcome["match"]["state"], "unmatched");
    assert!(outcome.get("warning").is_none());
}
