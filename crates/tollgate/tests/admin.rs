mod support;

use common::models::unix_now;
use hyper::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{key, openai_setting, read_json, Harness};

const CHAT_PATH: &str = "/api/providers/openai/v1/chat/completions";

#[tokio::test]
async fn test_key_lifecycle_through_admin_api() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer upstream-admin")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model":"gpt-4","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#)
        .expect(1)
        .create_async()
        .await;
    let mut harness = Harness::new(&upstream.url(), key(&[]), vec![], vec![]).await;

    let (status, setting) = harness
        .admin(
            "POST",
            "/api/provider-settings",
            Some(json!({"provider": "openai", "setting": {"apikey": "upstream-admin"}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(setting["setting"]["apikey"], "*****");
    let setting_id = setting["id"].as_str().unwrap().to_string();

    let (status, created) = harness
        .admin(
            "POST",
            "/api/key-management/keys",
            Some(json!({
                "key": "sk-admin",
                "keyId": "admin-key",
                "name": "created over http",
                "tags": ["team-a"],
                "settingIds": [setting_id],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["keyId"], "admin-key");
    assert!(created.get("key").is_none());

    // the new key is usable without waiting for a periodic refresh
    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    let response = harness.post_with_secret(CHAT_PATH, "sk-admin", body.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;
    harness.drain().await;

    let (status, events) = harness
        .admin("GET", "/api/events?keyIds=admin-key", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.as_array().map(Vec::len), Some(1));

    let (status, _) = harness
        .admin(
            "PATCH",
            "/api/key-management/keys/admin-key",
            Some(json!({"revoked": true})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = read_json(harness.post_with_secret(CHAT_PATH, "sk-admin", body).await).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["type"], "auth_error");

    let (status, problem) = harness
        .admin(
            "PATCH",
            "/api/key-management/keys/admin-key",
            Some(json!({"revoked": false})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["status"], 400);
}

#[tokio::test]
async fn test_key_validation_errors() {
    let upstream = mockito::Server::new_async().await;
    let harness = Harness::new(&upstream.url(), key(&["s1"]), vec![openai_setting("s1")], vec![]).await;

    let (status, problem) = harness
        .admin(
            "POST",
            "/api/key-management/keys",
            Some(json!({"key": "sk-2", "name": "bad", "rateLimitOverTime": 5})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["instance"], "/api/key-management/keys");

    let (status, _) = harness
        .admin(
            "POST",
            "/api/key-management/keys",
            Some(json!({"key": "sk-2", "name": "unknown setting", "settingIds": ["missing"]})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = harness
        .admin(
            "POST",
            "/api/key-management/keys",
            Some(json!({"key": "sk-test", "name": "same secret"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, keys) = harness
        .admin("GET", "/api/key-management/keys", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(keys.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_reporting_buckets_events() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model":"gpt-4","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#)
        .expect(2)
        .create_async()
        .await;
    let mut harness = Harness::new(&upstream.url(), key(&["s1"]), vec![openai_setting("s1")], vec![]).await;

    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    for _ in 0..2 {
        let response = harness.post(CHAT_PATH, body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(harness.drain().await, 2);

    let now = unix_now();
    let (status, report) = harness
        .admin(
            "POST",
            "/api/reporting/events",
            Some(json!({
                "keyIds": ["k1"],
                "start": now - 3600,
                "end": now + 60,
                "increment": 7200,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let points = report["dataPoints"].as_array().unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0]["numberOfRequests"], 2);
    assert_eq!(points[0]["promptTokenCount"], 10);
}

#[tokio::test]
async fn test_health() {
    let upstream = mockito::Server::new_async().await;
    let harness = Harness::new(&upstream.url(), key(&[]), vec![], vec![]).await;
    let (status, body) = harness.admin("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
