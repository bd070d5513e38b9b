//! Multi-step routes: each step is tried with its own timeout and retry
//! budget until one answers 2xx.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::consts::{ANTHROPIC_PROVIDER, AZURE_PROVIDER, OPENAI_PROVIDER};
use common::errors::ProxyError;
use common::models::{
    parse_duration, unix_now, Event, ProviderSetting, Route, RouteStep, SETTING_DEPLOYMENT_ID,
};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use llmcost::selector::select_bool;
use moka::future::Cache;
use moka::Expiry;
use rand::seq::IndexedRandom;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::custom::stream_options;
use super::providers::azure_deployment_url;
use super::response::{full, ProxyResponse};
use super::streaming::{relay_stream, StreamOptions};
use super::upstream::{build_response, route_headers, send, Exchange};
use crate::app_state::AppState;
use crate::auth::{apply_upstream_credential, fingerprint};
use crate::events::{Message, UsageKind};

/// A buffered 2xx answer kept for routes with caching enabled.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    provider: String,
    ttl: Duration,
}

pub type ResponseCache = Cache<String, CachedResponse>;

struct RouteTtl;

impl Expiry<String, CachedResponse> for RouteTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub fn response_cache() -> ResponseCache {
    Cache::builder()
        .max_capacity(10_000)
        .expire_after(RouteTtl)
        .build()
}

/// Body shape decides whether a route is serving embeddings or chat.
fn is_embeddings(request: &Value) -> bool {
    request.get("input").is_some() && request.get("messages").is_none()
}

/// Usage shape of a built-in step; custom providers are resolved when the
/// step runs.
fn builtin_usage(provider: &str, embeddings: bool) -> UsageKind {
    match (provider, embeddings) {
        (OPENAI_PROVIDER, true) => UsageKind::OpenAiEmbeddings,
        (OPENAI_PROVIDER, false) => UsageKind::OpenAiChat,
        (AZURE_PROVIDER, true) => UsageKind::AzureEmbeddings,
        (AZURE_PROVIDER, false) => UsageKind::AzureChat,
        (ANTHROPIC_PROVIDER, _) => UsageKind::AnthropicComplete,
        _ => UsageKind::Opaque,
    }
}

/// Usage shape used to price the prompt before any step runs.
pub fn route_usage(route: &Route, body: &[u8]) -> UsageKind {
    let embeddings = serde_json::from_slice::<Value>(body)
        .map(|v| is_embeddings(&v))
        .unwrap_or(false);
    route
        .steps
        .first()
        .map_or(UsageKind::Opaque, |step| builtin_usage(&step.provider, embeddings))
}

/// The step's request body: the inbound JSON with the step model and params.
fn step_body(request: &Value, step: &RouteStep) -> Result<Bytes, ProxyError> {
    let mut body = request.clone();
    let object = body
        .as_object_mut()
        .ok_or_else(|| ProxyError::Validation("route request body must be a JSON object".into()))?;
    if !step.model.is_empty() {
        object.insert("model".to_string(), Value::String(step.model.clone()));
    }
    for (name, value) in &step.params {
        object.insert(name.clone(), value.clone());
    }
    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(|e| ProxyError::Internal(format!("failed to encode step body: {e}")))
}

struct StepTarget {
    url: String,
    usage: UsageKind,
    auth_param: Option<String>,
    stream: Option<StreamOptions>,
}

async fn step_target(
    state: &AppState,
    route: &Route,
    step: &RouteStep,
    setting: &ProviderSetting,
    embeddings: bool,
) -> Result<StepTarget, ProxyError> {
    let upstream = &state.config.upstream;
    let limit = state.config.stream_capture_limit_bytes;
    let builtin = |url: String| StepTarget {
        url,
        usage: builtin_usage(&step.provider, embeddings),
        auth_param: None,
        stream: Some(StreamOptions::new(limit)),
    };
    let op = if embeddings { "embeddings" } else { "chat/completions" };

    match step.provider.as_str() {
        OPENAI_PROVIDER => Ok(builtin(format!(
            "{}/v1/{op}",
            upstream.openai_base_url.trim_end_matches('/')
        ))),
        ANTHROPIC_PROVIDER => Ok(builtin(format!(
            "{}/v1/complete",
            upstream.anthropic_base_url.trim_end_matches('/')
        ))),
        AZURE_PROVIDER => {
            let deployment = setting
                .param(SETTING_DEPLOYMENT_ID)
                .or_else(|| Some(step.model.as_str()).filter(|m| !m.is_empty()))
                .ok_or_else(|| {
                    ProxyError::Internal(format!("azure setting {} has no deploymentId", setting.id))
                })?;
            Ok(builtin(azure_deployment_url(upstream, setting, deployment, op)?))
        }
        name => {
            let provider = state.policies.custom_provider(name).await.ok_or_else(|| {
                ProxyError::NotFound(format!("custom provider {name} not found"))
            })?;
            let config = provider
                .route_config(&route.path)
                .or_else(|| provider.route_configs.first())
                .cloned()
                .ok_or_else(|| {
                    ProxyError::Internal(format!("custom provider {name} has no route configs"))
                })?;
            Ok(StepTarget {
                url: config.target_url.clone(),
                stream: Some(stream_options(&config, limit)),
                usage: UsageKind::Custom(config),
                auth_param: provider.authentication_param.clone(),
            })
        }
    }
}

struct Attempted {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    provider: String,
    usage: UsageKind,
    request_body: Bytes,
}

/// Run `route` for an admitted request. `settings` are every setting the key
/// holds; authorization already checked they cover each step.
pub async fn run_route(
    state: &Arc<AppState>,
    route: &Route,
    settings: &[ProviderSetting],
    inbound: &HeaderMap,
    body: &Bytes,
    mut exchange: Exchange,
) -> Result<ProxyResponse, ProxyError> {
    let request: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::Validation(format!("invalid JSON body: {e}")))?;
    let embeddings = is_embeddings(&request);
    let streaming = select_bool(&request, "stream") == Some(true);

    let cache_ttl = match route.cache_config.as_ref().filter(|c| c.enabled && !streaming) {
        Some(config) => Some(parse_duration(&config.ttl).map_err(ProxyError::Internal)?),
        None => None,
    };
    let cache_key = fingerprint(&format!("{}\n{}", route.id, String::from_utf8_lossy(body)));
    if cache_ttl.is_some() {
        if let Some(hit) = state.response_cache.get(&cache_key).await {
            debug!(route = %route.path, "route cache hit");
            metrics::counter!("forwarder.route_cache_hits").increment(1);
            publish_cache_hit(state, &exchange.event, &hit);
            return Ok(build_response(hit.status, &hit.headers, full(hit.body)));
        }
    }

    let mut last: Option<Attempted> = None;
    for (index, step) in route.steps.iter().enumerate() {
        let timeout = step.timeout_duration().map_err(ProxyError::Internal)?;
        let candidates: Vec<&ProviderSetting> = settings
            .iter()
            .filter(|s| s.provider == step.provider)
            .collect();
        let setting = *candidates.choose(&mut rand::rng()).ok_or_else(|| {
            ProxyError::Auth(format!("key has no provider setting for {}", step.provider))
        })?;
        let target = step_target(state, route, step, setting, embeddings).await?;
        let request_body = step_body(&request, step)?;

        for attempt in 1..=step.attempts() {
            let mut headers = route_headers(inbound);
            apply_upstream_credential(&mut headers, setting, target.auth_param.as_deref())?;
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

            let upstream = match send(
                &state.http_client,
                Method::POST,
                &target.url,
                headers,
                request_body.clone(),
                timeout,
            )
            .await
            {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(step = index, attempt, provider = %step.provider, error = %e, "route step failed to reach upstream");
                    continue;
                }
            };

            let status = upstream.status();
            exchange.event.provider = step.provider.clone();
            exchange.usage = target.usage.clone();
            exchange.request_body = request_body.clone();

            if status.is_success() && streaming {
                if let Some(options) = target.stream.clone() {
                    return Ok(relay_stream(upstream, exchange, state.bus.clone(), options));
                }
            }

            let headers = upstream.headers().clone();
            let body = match upstream.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(step = index, attempt, error = %e, "failed to read route step response");
                    continue;
                }
            };

            if status.is_success() {
                info!(route = %route.path, step = index, attempt, provider = %step.provider, "route step succeeded");
                if let Some(ttl) = cache_ttl {
                    state
                        .response_cache
                        .insert(
                            cache_key,
                            CachedResponse {
                                status,
                                headers: headers.clone(),
                                body: body.clone(),
                                provider: step.provider.clone(),
                                ttl,
                            },
                        )
                        .await;
                }
                exchange.publish(&state.bus, status.as_u16(), body.clone(), false, false);
                return Ok(build_response(status, &headers, full(body)));
            }

            warn!(step = index, attempt, provider = %step.provider, status = status.as_u16(), "route step returned an error status");
            last = Some(Attempted {
                status,
                headers,
                body,
                provider: step.provider.clone(),
                usage: target.usage.clone(),
                request_body: request_body.clone(),
            });
        }
    }

    match last {
        Some(attempted) => {
            exchange.event.provider = attempted.provider;
            exchange.usage = attempted.usage;
            exchange.request_body = attempted.request_body;
            exchange.publish(&state.bus, attempted.status.as_u16(), attempted.body.clone(), false, false);
            Ok(build_response(attempted.status, &attempted.headers, full(attempted.body)))
        }
        None => {
            exchange.publish(&state.bus, 0, Bytes::new(), false, false);
            Err(ProxyError::Upstream(format!(
                "no step of route {} reached its upstream",
                route.path
            )))
        }
    }
}

/// A cache hit costs nothing; it is recorded as an already-priced event.
fn publish_cache_hit(state: &AppState, template: &Event, hit: &CachedResponse) {
    let event = Event {
        created_at: unix_now(),
        provider: hit.provider.clone(),
        status: hit.status.as_u16(),
        ..template.clone()
    };
    state.bus.publish(Message::Event(event));
}
