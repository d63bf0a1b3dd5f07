//! Generation job tests: credit hold, settlement, refund and callbacks.

mod common;

use axum::http::StatusCode;
use common::{auth_header_for, Scripted, TestHarness, ADMIN_KEY, PROVIDER_CALLBACK_SECRET};
use creditline_core::{AccountId, JobId};
use creditline_service::crypto::hmac_sha256_hex;
use creditline_service::handlers::webhooks::PROVIDER_SIGNATURE_HEADER;
use creditline_store::Store;
use serde_json::json;

const IMAGE: &str = "https://img.example.com/portrait.png";

// ============================================================================
// Helpers
// ============================================================================

async fn create_upscale(harness: &TestHarness) -> serde_json::Value {
    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "kind": "upscale", "image_url": IMAGE, "factor": 4 }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    response.json()
}

async fn post_callback(harness: &TestHarness, body: &serde_json::Value) -> axum_test::TestResponse {
    let body = body.to_string();
    harness
        .server
        .post("/webhooks/provider")
        .add_header(
            PROVIDER_SIGNATURE_HEADER,
            hmac_sha256_hex(PROVIDER_CALLBACK_SECRET, &body),
        )
        .text(body)
        .await
}

// ============================================================================
// Single jobs
// ============================================================================

#[tokio::test]
async fn completed_job_spends_held_credits() {
    let harness = TestHarness::with_provider(Scripted::Complete("https://cdn.example.com/out.png".into()));
    harness.create_funded_account(100).await;

    let job = create_upscale(&harness).await;
    assert_eq!(job["credit_cost"], 20);
    // Held before the response
    assert_eq!(harness.balance().await, 80);

    let job = harness.wait_for_job(job["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result_url"], "https://cdn.example.com/out.png");
    assert_eq!(harness.balance().await, 80);
}

#[tokio::test]
async fn failed_job_refunds_held_credits() {
    let harness = TestHarness::with_provider(Scripted::Fail("nsfw content".into()));
    harness.create_funded_account(100).await;

    let job = create_upscale(&harness).await;
    let job = harness.wait_for_job(job["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error_message"], "nsfw content");
    assert_eq!(harness.balance().await, 100);

    let ledger: serde_json::Value = harness
        .server
        .get("/v1/credits/ledger")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    assert_eq!(ledger["entries"][0]["kind"], "refund");
    assert_eq!(ledger["entries"][0]["amount"], 20);
    assert_eq!(ledger["entries"][1]["kind"], "deduct");
}

#[tokio::test]
async fn provider_error_refunds_held_credits() {
    let harness = TestHarness::with_provider(Scripted::Error);
    harness.create_funded_account(100).await;

    let job = create_upscale(&harness).await;
    let job = harness.wait_for_job(job["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn missing_provider_fails_and_refunds() {
    let harness = TestHarness::new();
    harness.create_funded_account(100).await;

    let job = create_upscale(&harness).await;
    let job = harness.wait_for_job(job["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn insufficient_credits_creates_no_job() {
    let harness = TestHarness::with_provider(Scripted::Complete("https://cdn.example.com/out.png".into()));
    harness.create_funded_account(15).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "kind": "upscale", "image_url": IMAGE, "factor": 4 }))
        .await;
    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["details"]["required"], 20);

    let jobs: serde_json::Value = harness
        .server
        .get("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    assert!(jobs["jobs"].as_array().unwrap().is_empty());
    assert_eq!(harness.balance().await, 15);
}

#[tokio::test]
async fn invalid_payload_is_rejected_without_charge() {
    let harness = TestHarness::new();
    harness.create_funded_account(100).await;

    harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "kind": "upscale", "image_url": IMAGE, "factor": 3 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn jobs_are_private_to_their_owner() {
    let harness = TestHarness::with_provider(Scripted::Accept("task-1".into()));
    harness.create_funded_account(100).await;
    let job = create_upscale(&harness).await;

    let other = AccountId::generate();
    harness
        .server
        .get(&format!("/v1/jobs/{}", job["id"].as_str().unwrap()))
        .add_header("authorization", auth_header_for(&other))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    harness
        .server
        .get("/v1/jobs/not-a-job-id")
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn batch_holds_one_charge_split_across_items() {
    let harness = TestHarness::with_provider(Scripted::Complete("https://cdn.example.com/out.png".into()));
    harness.create_funded_account(100).await;

    let response = harness
        .server
        .post("/v1/jobs/batch")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({
            "image_urls": [IMAGE, IMAGE, IMAGE],
            "mode": "soft_glow",
            "pro_mode": false
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["total_cost"], 50);
    let costs: Vec<i64> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["credit_cost"].as_i64().unwrap())
        .collect();
    assert_eq!(costs, vec![18, 16, 16]);
    assert!(body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .all(|j| j["batch_id"] == body["batch_id"]));

    for job in body["jobs"].as_array().unwrap() {
        let job = harness.wait_for_job(job["id"].as_str().unwrap()).await;
        assert_eq!(job["status"], "completed");
    }
    assert_eq!(harness.balance().await, 50);
}

#[tokio::test]
async fn failed_batch_items_refund_their_share() {
    let harness = TestHarness::with_provider(Scripted::Fail("provider down".into()));
    harness.create_funded_account(100).await;

    let body: serde_json::Value = harness
        .server
        .post("/v1/jobs/batch")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({
            "image_urls": [IMAGE, IMAGE],
            "mode": "natural_clean",
            "pro_mode": true
        }))
        .await
        .json();
    assert_eq!(body["total_cost"], 55);

    for job in body["jobs"].as_array().unwrap() {
        harness.wait_for_job(job["id"].as_str().unwrap()).await;
    }
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn batch_size_is_bounded() {
    let harness = TestHarness::new();
    harness.create_funded_account(100).await;

    harness
        .server
        .post("/v1/jobs/batch")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "image_urls": [IMAGE], "mode": "soft_glow" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 100);
}

// ============================================================================
// Provider callbacks
// ============================================================================

#[tokio::test]
async fn callback_settles_accepted_job_once() {
    let harness = TestHarness::with_provider(Scripted::Accept("task-42".into()));
    harness.create_funded_account(100).await;

    let job = create_upscale(&harness).await;
    let job_id = job["id"].as_str().unwrap().to_string();
    let id: JobId = job_id.parse().unwrap();

    // Wait until the provider has accepted the task
    for _ in 0..100 {
        let job = harness
            .store
            .get_job(&id)
            .await
            .unwrap()
            .unwrap();
        if job.external_task_id.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let body: serde_json::Value = post_callback(
        &harness,
        &json!({ "task_id": "task-42", "status": "failed", "error": "gpu oom" }),
    )
    .await
    .json();
    assert_eq!(body["applied"], true);
    assert_eq!(harness.balance().await, 100);

    // A late success cannot revive a refunded job
    let body: serde_json::Value = post_callback(
        &harness,
        &json!({ "task_id": "task-42", "status": "completed", "result_url": "https://cdn.example.com/x.png" }),
    )
    .await
    .json();
    assert_eq!(body["applied"], false);

    let job = harness.wait_for_job(&job_id).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn callback_requires_valid_signature() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/webhooks/provider")
        .add_header(PROVIDER_SIGNATURE_HEADER, "00".repeat(32))
        .text(json!({ "task_id": "t", "status": "completed" }).to_string())
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_for_unknown_task_is_not_found() {
    let harness = TestHarness::new();

    post_callback(&harness, &json!({ "task_id": "ghost", "status": "pending" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Admin cancel
// ============================================================================

#[tokio::test]
async fn cancel_stops_job_without_moving_credits() {
    let harness = TestHarness::with_provider(Scripted::Accept("task-7".into()));
    harness.create_funded_account(100).await;
    let job = create_upscale(&harness).await;
    let job_id = job["id"].as_str().unwrap();

    let response = harness
        .server
        .post(&format!("/v1/admin/jobs/{job_id}/cancel"))
        .add_header("x-admin-key", ADMIN_KEY)
        .json(&json!({ "reason": "abuse report" }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "cancelled");
    assert_eq!(harness.balance().await, 80);
}

#[tokio::test]
async fn cancel_of_finished_job_conflicts() {
    let harness = TestHarness::with_provider(Scripted::Complete("https://cdn.example.com/out.png".into()));
    harness.create_funded_account(100).await;
    let job = create_upscale(&harness).await;
    let job_id = job["id"].as_str().unwrap();
    harness.wait_for_job(job_id).await;

    harness
        .server
        .post(&format!("/v1/admin/jobs/{job_id}/cancel"))
        .add_header("x-admin-key", ADMIN_KEY)
        .await
        .assert_status(StatusCode::CONFLICT);
}
