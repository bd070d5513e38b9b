use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use common::consts::REQUEST_ID_HEADER;
use common::errors::ProxyError;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::Request;
use llmcost::selector::select_bool;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::custom::forward_custom;
use super::providers::{upstream_url, usage_for};
use super::request::{extract_custom_event_id, extract_request_id};
use super::response::ProxyResponse;
use super::routes::{route_usage, run_route};
use super::streaming::{relay_stream, StreamOptions};
use super::upstream::{outbound_headers, relay, send, unreachable, Exchange};
use crate::app_state::AppState;
use crate::auth::{apply_upstream_credential, Admission, Target};
use crate::billing::PolicyViolation;
use crate::events::UsageKind;

/// Entry point for every proxied path. Errors become the JSON error body
/// with the correlation id echoed back.
pub async fn handle_proxy<B>(
    request: Request<B>,
    state: Arc<AppState>,
) -> Result<ProxyResponse, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let request_id = extract_request_id(&request);
    let request_span = info_span!(
        "proxy",
        request_id = %request_id,
        http.method = %request.method(),
        http.path = %request.uri().path(),
        key_id = tracing::field::Empty,
        provider = tracing::field::Empty,
    );

    let response = async {
        match proxy_inner(request, &state, &request_id).await {
            Ok(mut response) => {
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    response.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                response
            }
            Err(e) => {
                metrics::counter!("proxy.errors", "type" => e.kind()).increment(1);
                match &e {
                    ProxyError::Internal(_) | ProxyError::Upstream(_) => {
                        error!(error_type = e.kind(), error = %e, "request failed")
                    }
                    _ => info!(error_type = e.kind(), error = %e, "request rejected"),
                }
                e.into_response(&request_id)
            }
        }
    }
    .instrument(request_span)
    .await;

    Ok(response)
}

async fn proxy_inner<B>(
    request: Request<B>,
    state: &Arc<AppState>,
    request_id: &str,
) -> Result<ProxyResponse, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let body = body
        .collect()
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to read request body: {e}")))?
        .to_bytes();
    if state.config.log_mode.logs_bodies() {
        debug!(body = %String::from_utf8_lossy(&body), "request body");
    }

    // ----------------------------------------------------------------
    // Authenticate and validate
    // ----------------------------------------------------------------
    let admission = state
        .authenticator
        .authenticate(parts.method.as_str(), &path, &parts.headers)
        .await?;
    Span::current().record("key_id", admission.key.key_id.as_str());
    Span::current().record("provider", admission.target.provider_name());

    let usage = match &admission.target {
        Target::Provider {
            provider,
            upstream_path,
        } => usage_for(provider, upstream_path)?,
        Target::Route(route) => route_usage(route, &body),
        Target::Custom { config, .. } => UsageKind::Custom(config.clone()),
    };
    let prompt_cost = state.decorator.estimate_prompt_cost(&usage, &body);

    if let Err(violation) = state.validator.validate(&admission.key, prompt_cost).await {
        if violation == PolicyViolation::Expired {
            if let Err(e) = state.policies.revoke_key(&admission.key, "ttl").await {
                warn!(error = %e, "failed to revoke expired key");
            }
        }
        return Err(violation.into());
    }

    // ----------------------------------------------------------------
    // Dispatch
    // ----------------------------------------------------------------
    let exchange = Exchange::new(
        request_id,
        &admission.key,
        &parts.method,
        &path,
        extract_custom_event_id(&parts.headers),
        usage,
        body.clone(),
    )
    .with_provider(admission.target.provider_name());

    dispatch(state, &parts, admission, body, exchange).await
}

async fn dispatch(
    state: &Arc<AppState>,
    parts: &Parts,
    admission: Admission,
    body: Bytes,
    exchange: Exchange,
) -> Result<ProxyResponse, ProxyError> {
    let selected = admission.selected_setting().cloned();
    match &admission.target {
        Target::Provider {
            provider,
            upstream_path,
        } => {
            let setting = selected
                .ok_or_else(|| ProxyError::Internal("no provider setting selected".into()))?;
            let url = upstream_url(
                &state.config.upstream,
                provider,
                upstream_path,
                parts.uri.query(),
                &setting,
            )?;
            let mut headers = outbound_headers(&parts.headers);
            apply_upstream_credential(&mut headers, &setting, None)?;
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

            let streaming = serde_json::from_slice::<Value>(&body)
                .map(|request| select_bool(&request, "stream") == Some(true))
                .unwrap_or(false);

            let upstream = match send(
                &state.http_client,
                parts.method.clone(),
                &url,
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
                let options = StreamOptions::new(state.config.stream_capture_limit_bytes);
                return Ok(relay_stream(upstream, exchange, state.bus.clone(), options));
            }
            relay(upstream, exchange, &state.bus, state.config.log_mode).await
        }
        Target::Route(route) => {
            run_route(state, route, &admission.settings, &parts.headers, &body, exchange).await
        }
        Target::Custom { provider, config } => {
            let setting = selected
                .ok_or_else(|| ProxyError::Internal("no provider setting selected".into()))?;
            forward_custom(
                state,
                provider,
                config,
                &setting,
                parts.method.clone(),
                &parts.headers,
                body,
                exchange,
            )
            .await
        }
    }
}
