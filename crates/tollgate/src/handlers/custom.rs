use std::sync::Arc;

use bytes::Bytes;
use common::consts::DEFAULT_STREAM_END_WORD;
use common::errors::ProxyError;
use common::models::{CustomProvider, ProviderSetting, RouteConfig};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::Method;
use llmcost::selector::select_bool;
use serde_json::Value;

use super::response::ProxyResponse;
use super::streaming::{relay_stream, StreamOptions};
use super::upstream::{outbound_headers, relay, send, unreachable, Exchange};
use crate::app_state::AppState;
use crate::auth::apply_upstream_credential;

pub fn stream_options(config: &RouteConfig, capture_limit: usize) -> StreamOptions {
    StreamOptions {
        end_word: config
            .stream_end_word
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| DEFAULT_STREAM_END_WORD.to_string()),
        max_empty_messages: config.stream_max_empty_messages.unwrap_or(0),
        capture_limit,
    }
}

/// Whether the request body asks for a stream, per the route config.
fn wants_stream(config: &RouteConfig, body: &[u8]) -> bool {
    let Some(location) = config.stream_location.as_deref() else {
        return false;
    };
    serde_json::from_slice::<Value>(body)
        .map(|request| select_bool(&request, location) == Some(true))
        .unwrap_or(false)
}

/// Forward to a custom provider's `targetUrl` unmodified.
#[allow(clippy::too_many_arguments)]
pub async fn forward_custom(
    state: &Arc<AppState>,
    provider: &CustomProvider,
    config: &RouteConfig,
    setting: &ProviderSetting,
    method: Method,
    inbound: &HeaderMap,
    body: Bytes,
    exchange: Exchange,
) -> Result<ProxyResponse, ProxyError> {
    let mut headers = outbound_headers(inbound);
    apply_upstream_credential(&mut headers, setting, provider.authentication_param.as_deref())?;
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    let streaming = wants_stream(config, &body);

    let upstream = match send(
        &state.http_client,
        method,
        &config.target_url,
        headers,
        body,
        state.config.upstream_timeout(),
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => return Err(unreachable(exchange, &state.bus, &e)),
    };

    if streaming && upstream.status().is_success() {
        let options = stream_options(config, state.config.stream_capture_limit_bytes);
        return Ok(relay_stream(upstream, exchange, state.bus.clone(), options));
    }
    relay(upstream, exchange, &state.bus, state.config.log_mode).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RouteConfig {
        RouteConfig {
            path: "/v1/generate".into(),
            target_url: "http://localhost/generate".into(),
            stream_location: Some("stream".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_stream_options_defaults() {
        let options = stream_options(&config(), 1024);
        assert_eq!(options.end_word, "[DONE]");
        assert_eq!(options.max_empty_messages, 0);

        let tuned = RouteConfig {
            stream_end_word: Some("END".into()),
            stream_max_empty_messages: Some(3),
            ..config()
        };
        let options = stream_options(&tuned, 1024);
        assert_eq!(options.end_word, "END");
        assert_eq!(options.max_empty_messages, 3);
    }

    #[test]
    fn test_wants_stream_uses_location() {
        assert!(wants_stream(&config(), br#"{"stream": true}"#));
        assert!(!wants_stream(&config(), br#"{"stream": false}"#));
        let without = RouteConfig {
            stream_location: None,
            ..config()
        };
        assert!(!wants_stream(&without, br#"{"stream": true}"#));
    }
}
