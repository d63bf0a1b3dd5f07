//! Referral code tests.

mod common;

use axum::http::StatusCode;
use common::{auth_header_for, create_account_for, TestHarness, ADMIN_KEY};
use creditline_core::AccountId;
use serde_json::json;

async fn referral_code(harness: &TestHarness) -> String {
    let body: serde_json::Value = harness
        .server
        .get("/v1/referrals/code")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    body["code"].as_str().unwrap().to_string()
}

async fn referred_account(harness: &TestHarness) -> AccountId {
    let id = AccountId::generate();
    create_account_for(&harness.server, &id).await;
    id
}

#[tokio::test]
async fn code_is_stable_and_validates() {
    let harness = TestHarness::new();
    harness.create_account().await;

    let code = referral_code(&harness).await;
    assert_eq!(code.len(), 8);
    assert_eq!(referral_code(&harness).await, code);

    let body: serde_json::Value = harness
        .server
        .get(&format!("/v1/referrals/validate/{}", code.to_lowercase()))
        .await
        .json();
    assert_eq!(body["valid"], true);
    assert_eq!(body["code"], code);

    let body: serde_json::Value = harness
        .server
        .get("/v1/referrals/validate/ZZZZZZZZ")
        .await
        .json();
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn apply_credits_both_sides_once() {
    let harness = TestHarness::new();
    harness.create_account().await;
    let code = referral_code(&harness).await;
    let friend = referred_account(&harness).await;

    let response = harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code.to_lowercase() }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["referral"]["referrer_bonus"], 50);
    assert_eq!(body["referral"]["referred_bonus"], 20);
    assert_eq!(body["balance"], 45);
    assert_eq!(harness.balance().await, 75);

    let again = harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code }))
        .await;
    again.assert_status(StatusCode::CONFLICT);
    let body: serde_json::Value = again.json();
    assert_eq!(body["error"]["code"], "already_referred");
    assert_eq!(harness.balance().await, 75);

    let stats: serde_json::Value = harness
        .server
        .get("/v1/referrals/stats")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    assert_eq!(stats["referral_count"], 1);
    assert_eq!(stats["total_bonus_earned"], 50);
    assert_eq!(stats["referrals"][0]["referred_id"], friend.to_string());

    let info: serde_json::Value = harness
        .server
        .get("/v1/referrals/info")
        .add_header("authorization", auth_header_for(&friend))
        .await
        .json();
    assert_eq!(info["referred"], true);
    assert_eq!(info["referred_by"], harness.account_id.to_string());
}

#[tokio::test]
async fn own_code_is_refused() {
    let harness = TestHarness::new();
    harness.create_account().await;
    let code = referral_code(&harness).await;

    let response = harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "code": code }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "self_referral");
    assert_eq!(harness.balance().await, 25);
}

#[tokio::test]
async fn unknown_code_is_refused() {
    let harness = TestHarness::new();
    harness.create_account().await;

    let response = harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "code": "NOPE1234" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_referral_code");
}

#[tokio::test]
async fn disabled_referrals_refuse_and_bonuses_follow_settings() {
    let harness = TestHarness::new();
    harness.create_account().await;
    let code = referral_code(&harness).await;
    let friend = referred_account(&harness).await;

    harness
        .server
        .put("/v1/admin/settings/referral_system_enabled")
        .add_header("x-admin-key", ADMIN_KEY)
        .json(&json!({ "value": "false" }))
        .await
        .assert_status_ok();

    harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    for (key, value) in [
        ("referral_system_enabled", "true"),
        ("referral_bonus_referrer", "100"),
    ] {
        harness
            .server
            .put(&format!("/v1/admin/settings/{key}"))
            .add_header("x-admin-key", ADMIN_KEY)
            .json(&json!({ "value": value }))
            .await
            .assert_status_ok();
    }

    let info: serde_json::Value = harness
        .server
        .get("/v1/referrals/info")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    assert_eq!(info["enabled"], true);
    assert_eq!(info["referrer_bonus"], 100);

    harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code }))
        .await
        .assert_status_ok();
    assert_eq!(harness.balance().await, 125);
}

#[tokio::test]
async fn zero_referred_bonus_still_links_accounts() {
    let harness = TestHarness::new();
    harness.create_account().await;
    let code = referral_code(&harness).await;
    let friend = referred_account(&harness).await;

    harness
        .server
        .put("/v1/admin/settings/referral_bonus_referred")
        .add_header("x-admin-key", ADMIN_KEY)
        .json(&json!({ "value": "0" }))
        .await
        .assert_status_ok();

    let response = harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["balance"], 25);
    assert_eq!(body["referral"]["referred_bonus"], 0);

    harness
        .server
        .post("/v1/referrals/apply")
        .add_header("authorization", auth_header_for(&friend))
        .json(&json!({ "code": code }))
        .await
        .assert_status(StatusCode::CONFLICT);
    assert_eq!(harness.balance().await, 75);

    let stats: serde_json::Value = harness
        .server
        .get("/v1/referrals/stats")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    assert_eq!(stats["referral_count"], 1);
}
