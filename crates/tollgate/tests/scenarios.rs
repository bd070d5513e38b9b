mod support;

use std::time::Duration;

use common::configuration::Configuration;
use common::models::{Route, RouteStep};
use common::window::WindowUnit;
use http_body_util::BodyExt;
use hyper::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{key, openai_setting, read_json, setting, Harness, SECRET};
use tollgate::auth::fingerprint;

const CHAT_PATH: &str = "/api/providers/openai/v1/chat/completions";

const STREAM_BODY: &str = concat!(
    "data: {\"model\":\"gpt-3.5-turbo\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
    "data: {\"model\":\"gpt-3.5-turbo\",\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
    "data: [DONE]\n\n",
);
/// Length of the first `data:` message in `STREAM_BODY`, blank line included.
const FIRST_STREAM_MESSAGE_LEN: usize = 75;

fn chat_completion(model: &str, prompt_tokens: i64, completion_tokens: i64) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello there"},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_openai_request_is_forwarded_and_accounted() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer upstream")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_completion("gpt-4", 9, 3))
        .expect(1)
        .create_async()
        .await;

    let mut harness = Harness::new(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    let response = harness
        .post(
            CHAT_PATH,
            json!({"model": "gpt-4", "messages": [{"role": "system", "content": "hi"}]}),
        )
        .await;
    assert!(response.headers().contains_key("x-request-id"));
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    mock.assert_async().await;

    assert_eq!(harness.drain().await, 1);
    let events = harness.events().await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.key_id, "k1");
    assert_eq!(event.provider, "openai");
    assert_eq!(event.model, "gpt-4");
    assert_eq!(event.status, 200);
    assert!(event.prompt_token_count > 0);
    assert!(event.cost_in_usd > 0.0);
}

#[tokio::test]
async fn test_rate_limit_refuses_second_request() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_completion("gpt-4", 9, 3))
        .expect(1)
        .create_async()
        .await;

    let mut limited = key(&["s1"]);
    limited.rate_limit_over_time = 1;
    limited.rate_limit_unit = Some(WindowUnit::Minute);
    let mut harness =
        Harness::new(&upstream.url(), limited, vec![openai_setting("s1")], vec![]).await;

    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    let (status, _) = read_json(harness.post(CHAT_PATH, body.clone()).await).await;
    assert_eq!(status, StatusCode::OK);
    harness.drain().await;

    let (status, error) = read_json(harness.post(CHAT_PATH, body).await).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error["error"]["type"], "rate_limit_error");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_windowed_cost_limit_refuses_after_spend_is_recorded() {
    let mut upstream = mockito::Server::new_async().await;
    // 10 prompt + 100 completion tokens of gpt-3.5-turbo costs well over the limit
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_completion("gpt-3.5-turbo", 10, 100))
        .expect(1)
        .create_async()
        .await;

    let mut limited = key(&["s1"]);
    limited.cost_limit_in_usd_over_time = 0.0001;
    limited.cost_limit_in_usd_unit = Some(WindowUnit::Day);
    let mut harness =
        Harness::new(&upstream.url(), limited, vec![openai_setting("s1")], vec![]).await;

    let body = json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]});
    let (status, _) = read_json(harness.post(CHAT_PATH, body.clone()).await).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(harness.drain().await, 1);
    let events = harness.events().await;
    assert!(events[0].cost_in_usd > 0.0001);

    let (status, error) = read_json(harness.post(CHAT_PATH, body).await).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(error["error"]["type"], "cost_limit_error");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_expired_key_is_refused_and_revoked() {
    let upstream = mockito::Server::new_async().await;

    let mut short_lived = key(&["s1"]);
    short_lived.ttl = Some("1s".to_string());
    let harness = Harness::new(
        &upstream.url(),
        short_lived,
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let response = harness
        .post(
            CHAT_PATH,
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    let (status, error) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["type"], "expiration_error");

    let cached = harness.policies.key_by_hash(&fingerprint(SECRET)).await.unwrap();
    assert!(cached.revoked);
    assert_eq!(cached.revoked_reason.as_deref(), Some("ttl"));
}

#[tokio::test]
async fn test_route_falls_back_to_next_step() {
    let mut upstream = mockito::Server::new_async().await;
    let failing = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body(r#"{"error":{"message":"overloaded"}}"#)
        .expect(1)
        .create_async()
        .await;
    let fallback = upstream
        .mock("POST", "/v1/complete")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"completion":" Hello from claude","model":"claude-2","stop_reason":"stop_sequence"}"#)
        .expect(1)
        .create_async()
        .await;

    let route = Route {
        id: "r1".to_string(),
        path: "/chat".to_string(),
        name: "chat with fallback".to_string(),
        key_ids: vec!["k1".to_string()],
        steps: vec![
            RouteStep {
                provider: "openai".to_string(),
                model: "gpt-3.5-turbo".to_string(),
                retries: 1,
                timeout: "2s".to_string(),
                ..Default::default()
            },
            RouteStep {
                provider: "anthropic".to_string(),
                model: "claude-2".to_string(),
                retries: 1,
                timeout: "5s".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let mut harness = Harness::new(
        &upstream.url(),
        key(&["s1", "s2"]),
        vec![openai_setting("s1"), setting("s2", "anthropic", "anthropic-key")],
        vec![route],
    )
    .await;

    let response = harness
        .post(
            "/api/routes/chat",
            json!({"messages": [{"role": "user", "content": "hi"}], "prompt": "\n\nHuman: hi\n\nAssistant:"}),
        )
        .await;
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "claude-2");
    failing.assert_async().await;
    fallback.assert_async().await;

    harness.drain().await;
    let events = harness.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].provider, "anthropic");
    assert_eq!(events[0].status, 200);
}

#[tokio::test]
async fn test_key_without_setting_for_provider_is_refused() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/v1/complete")
        .expect(0)
        .create_async()
        .await;

    let harness = Harness::new(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    let response = harness
        .post(
            "/api/providers/anthropic/v1/complete",
            json!({"model": "claude-2", "prompt": "\n\nHuman: hi\n\nAssistant:"}),
        )
        .await;
    let (status, error) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["type"], "auth_error");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unknown_virtual_key_is_refused() {
    let upstream = mockito::Server::new_async().await;
    let harness = Harness::new(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    let request = hyper::Request::builder()
        .method("POST")
        .uri(CHAT_PATH)
        .header("authorization", "Bearer sk-someone-else")
        .body(http_body_util::Full::new(bytes::Bytes::from_static(b"{}")))
        .unwrap();
    let response = tollgate::handlers::handle_proxy(request, harness.state.clone())
        .await
        .unwrap();
    let (status, error) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["type"], "auth_error");
    assert!(error["error"]["correlationId"].as_str().is_some());
}

async fn stream_upstream() -> (mockito::ServerGuard, mockito::Mock) {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(STREAM_BODY)
        .expect(1)
        .create_async()
        .await;
    (upstream, mock)
}

fn stream_request() -> serde_json::Value {
    json!({
        "model": "gpt-3.5-turbo",
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn test_stream_is_relayed_unchanged_and_accounted_once() {
    let (upstream, mock) = stream_upstream().await;
    let mut harness = Harness::new(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    let response = harness.post(CHAT_PATH, stream_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], STREAM_BODY.as_bytes());
    mock.assert_async().await;

    // the relay publishes before it lets go of the client body
    assert_eq!(harness.drain().await, 1);
    let events = harness.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, 200);
    assert_eq!(events[0].model, "gpt-3.5-turbo");
    assert!(events[0].prompt_token_count > 0);
    assert_eq!(events[0].completion_token_count, 2);
    assert!(events[0].cost_in_usd > 0.0);
}

#[tokio::test]
async fn test_stream_capture_limit_truncates_accounting_only() {
    let (upstream, _mock) = stream_upstream().await;
    let config = Configuration {
        stream_capture_limit_bytes: FIRST_STREAM_MESSAGE_LEN,
        ..Default::default()
    };
    let mut harness = Harness::with_config(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
        config,
    )
    .await;

    let response = harness.post(CHAT_PATH, stream_request()).await;
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], STREAM_BODY.as_bytes());

    assert_eq!(harness.drain().await, 1);
    let events = harness.events().await;
    assert_eq!(events.len(), 1);
    // only "Hello" made it into the capture
    assert_eq!(events[0].completion_token_count, 1);
    assert!(events[0].cost_in_usd > 0.0);
}

#[tokio::test]
async fn test_stream_abandoned_by_client_is_still_accounted() {
    let (upstream, _mock) = stream_upstream().await;
    let mut harness = Harness::new(
        &upstream.url(),
        key(&["s1"]),
        vec![openai_setting("s1")],
        vec![],
    )
    .await;

    let response = harness.post(CHAT_PATH, stream_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    let mut handled = 0;
    for _ in 0..100 {
        handled += harness.drain().await;
        if handled > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handled, 1);
    let events = harness.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, 200);
}
