use std::time::{Duration, Instant};

use bytes::Bytes;
use common::configuration::LogMode;
use common::consts::CUSTOM_EVENT_ID_HEADER;
use common::errors::ProxyError;
use common::models::{unix_now, Event, Key};
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Method, Response, StatusCode};
use llmcost::selector::select_str;
use opentelemetry::global;
use opentelemetry_http::HeaderInjector;
use serde_json::Value;
use tracing::{debug, warn};

use super::response::{full, ProxyBody, ProxyResponse};
use crate::events::{EventBus, EventWithRequestAndContent, Message, UsageKind};

/// Headers that describe a single connection and are never relayed.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Inbound headers minus those reqwest or hyper recompute and the proxy's
/// own event id.
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    inbound
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name)
                && *name != header::HOST
                && *name != header::CONTENT_LENGTH
                && name.as_str() != CUSTOM_EVENT_ID_HEADER
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Route steps forward only non `x-*` headers.
pub fn route_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = outbound_headers(inbound);
    let extension: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-"))
        .cloned()
        .collect();
    for name in extension {
        headers.remove(name);
    }
    headers
}

/// Everything the request path knows about one proxied call, carried until
/// the response is complete and then published for accounting.
pub struct Exchange {
    pub event: Event,
    pub key: Key,
    pub usage: UsageKind,
    pub request_body: Bytes,
    /// Correlation id answered to the client; ties log lines to `event.id`.
    pub request_id: String,
    started: Instant,
}

impl Exchange {
    pub fn new(
        request_id: &str,
        key: &Key,
        method: &Method,
        path: &str,
        custom_id: Option<String>,
        usage: UsageKind,
        request_body: Bytes,
    ) -> Self {
        let model = serde_json::from_slice::<Value>(&request_body)
            .ok()
            .and_then(|v| select_str(&v, "model").map(str::to_string))
            .unwrap_or_default();
        Self {
            event: Event {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: unix_now(),
                key_id: key.key_id.clone(),
                tags: key.tags.clone(),
                model,
                path: path.to_string(),
                method: method.to_string(),
                custom_id,
                ..Default::default()
            },
            key: key.clone(),
            usage,
            request_body,
            request_id: request_id.to_string(),
            started: Instant::now(),
        }
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.event.provider = provider.to_string();
        self
    }

    /// Hand the finished exchange to the accounting consumers. Never blocks.
    pub fn publish(
        mut self,
        bus: &EventBus,
        status: u16,
        response_body: Bytes,
        streamed: bool,
        truncated: bool,
    ) {
        self.event.status = status;
        self.event.latency_ms = self.started.elapsed().as_millis() as i64;
        debug!(
            event_id = %self.event.id,
            request_id = %self.request_id,
            status,
            "publishing request event"
        );
        let delivered = bus.publish(Message::RequestContent(Box::new(EventWithRequestAndContent {
            event: self.event,
            key: self.key,
            usage: self.usage,
            request_body: self.request_body,
            response_body,
            streamed,
            truncated,
        })));
        if delivered == 0 {
            debug!("no consumer took the request event");
        }
    }
}

/// Dispatch one upstream request with the current trace context attached.
pub async fn send(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    mut headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<reqwest::Response, reqwest::Error> {
    global::get_text_map_propagator(|propagator| {
        let cx = tracing_opentelemetry::OpenTelemetrySpanExt::context(&tracing::Span::current());
        propagator.inject_context(&cx, &mut HeaderInjector(&mut headers));
    });
    debug!(url = %url, "dispatching upstream");

    client
        .request(method, url)
        .headers(headers)
        .timeout(timeout)
        .body(body)
        .send()
        .await
}

/// Response carrying the upstream status and end-to-end headers around `body`.
pub fn build_response(status: StatusCode, upstream_headers: &HeaderMap, body: ProxyBody) -> ProxyResponse {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        if !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

/// Buffer the upstream response, publish the exchange and relay it unchanged.
pub async fn relay(
    upstream: reqwest::Response,
    exchange: Exchange,
    bus: &EventBus,
    log_mode: LogMode,
) -> Result<ProxyResponse, ProxyError> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(status = status.as_u16(), error = %e, "failed to read upstream body");
            exchange.publish(bus, status.as_u16(), Bytes::new(), false, false);
            return Err(ProxyError::Upstream("failed to read upstream response".into()));
        }
    };

    if log_mode.logs_bodies() {
        debug!(status = status.as_u16(), body = %String::from_utf8_lossy(&body), "upstream response");
    }
    if !status.is_success() {
        debug!(status = status.as_u16(), "upstream returned an error status");
    }

    exchange.publish(bus, status.as_u16(), body.clone(), false, false);
    Ok(build_response(status, &headers, full(body)))
}

/// Transport failure: account the attempt with status 0 and answer 502.
pub fn unreachable(exchange: Exchange, bus: &EventBus, error: &reqwest::Error) -> ProxyError {
    warn!(error = %error, timeout = error.is_timeout(), "upstream request failed");
    exchange.publish(bus, 0, Bytes::new(), false, false);
    ProxyError::Upstream("failed to reach upstream provider".into())
}
