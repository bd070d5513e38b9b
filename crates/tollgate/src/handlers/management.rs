use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use common::consts::HEALTH_PATH;
use common::models::{
    AllowedPath, CustomProvider, Key, ProviderSetting, Route, RouteConfig, SETTING_API_KEY,
};
use common::window::WindowUnit;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use super::reporting::{handle_aggregate, handle_query_events};
use super::request::extract_request_id;
use super::response::{json_response, problem, ProxyResponse};
use crate::app_state::AppState;
use crate::auth::fingerprint;
use crate::storage::StoreError;

const KEYS_PATH: &str = "/api/key-management/keys";
const SETTINGS_PATH: &str = "/api/provider-settings";
const ROUTES_PATH: &str = "/api/routes";
const CUSTOM_PROVIDERS_PATH: &str = "/api/custom/providers";

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
            AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self, instance: &str) -> ProxyResponse {
        problem(self.status(), &self.to_string(), instance)
    }
}

impl From<StoreError> for AdminError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => AdminError::NotFound(format!("{what} not found")),
            StoreError::Conflict(what) => AdminError::Conflict(what),
            other => AdminError::Internal(other.to_string()),
        }
    }
}

// === Request types ===

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    /// Plaintext virtual key; only its fingerprint is stored.
    key: String,
    key_id: Option<String>,
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    ttl: Option<String>,
    #[serde(default)]
    cost_limit_in_usd: f64,
    #[serde(default)]
    cost_limit_in_usd_over_time: f64,
    cost_limit_in_usd_unit: Option<WindowUnit>,
    #[serde(default)]
    rate_limit_over_time: i64,
    rate_limit_unit: Option<WindowUnit>,
    #[serde(default)]
    setting_ids: Vec<String>,
    #[serde(default)]
    allowed_paths: Vec<AllowedPath>,
    route_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateKeyRequest {
    name: Option<String>,
    tags: Option<Vec<String>>,
    revoked: Option<bool>,
    revoked_reason: Option<String>,
    cost_limit_in_usd: Option<f64>,
    cost_limit_in_usd_over_time: Option<f64>,
    cost_limit_in_usd_unit: Option<WindowUnit>,
    rate_limit_over_time: Option<i64>,
    rate_limit_unit: Option<WindowUnit>,
    setting_ids: Option<Vec<String>>,
    allowed_paths: Option<Vec<AllowedPath>>,
    route_id: Option<String>,
}

#[derive(Deserialize)]
struct CreateSettingRequest {
    provider: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    setting: HashMap<String, String>,
}

#[derive(Deserialize)]
struct UpdateSettingRequest {
    name: Option<String>,
    /// Merged into the stored parameters.
    #[serde(default)]
    setting: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCustomProviderRequest {
    route_configs: Option<Vec<RouteConfig>>,
    authentication_param: Option<String>,
}

// === Route dispatcher ===

/// Admin listener entry point.
pub async fn handle_admin<B>(
    request: Request<B>,
    state: Arc<AppState>,
) -> Result<ProxyResponse, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let request_id = extract_request_id(&request);
    let path = request.uri().path().to_string();
    let span = info_span!(
        "admin",
        request_id = %request_id,
        http.method = %request.method(),
        http.path = %path,
    );

    let response = async {
        match admin_inner(request, &state).await {
            Ok(response) => response,
            Err(e) => {
                if let AdminError::Internal(_) = e {
                    warn!(error = %e, "admin request failed");
                }
                e.into_response(&path)
            }
        }
    }
    .instrument(span)
    .await;
    Ok(response)
}

async fn admin_inner<B>(request: Request<B>, state: &Arc<AppState>) -> Result<ProxyResponse, AdminError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().trim_end_matches('/');
    let body = body
        .collect()
        .await
        .map_err(|e| AdminError::Internal(format!("failed to read request body: {e}")))?
        .to_bytes();

    let (collection, id) = split_path(path);
    match (&parts.method, collection, id) {
        (&Method::GET, HEALTH_PATH, None) => Ok(health()),

        (&Method::POST, KEYS_PATH, None) => create_key(state, &body).await,
        (&Method::GET, KEYS_PATH, None) => {
            let tag = query_pairs(parts.uri.query())
                .into_iter()
                .find(|(k, _)| k == "tag")
                .map(|(_, v)| v);
            let keys = state.config_store.list_keys(tag.as_deref()).await?;
            Ok(json_response(StatusCode::OK, &keys))
        }
        (&Method::PATCH, KEYS_PATH, Some(key_id)) => update_key(state, key_id, &body).await,

        (&Method::POST, SETTINGS_PATH, None) => create_setting(state, &body).await,
        (&Method::GET, SETTINGS_PATH, None) => {
            let settings: Vec<ProviderSetting> = state
                .config_store
                .list_settings()
                .await?
                .iter()
                .map(ProviderSetting::redacted)
                .collect();
            Ok(json_response(StatusCode::OK, &settings))
        }
        (&Method::PATCH, SETTINGS_PATH, Some(id)) => update_setting(state, id, &body).await,

        (&Method::POST, ROUTES_PATH, None) => create_route(state, &body).await,
        (&Method::GET, ROUTES_PATH, None) => {
            let routes = state.config_store.list_routes().await?;
            Ok(json_response(StatusCode::OK, &routes))
        }
        (&Method::GET, ROUTES_PATH, Some(id)) => {
            let route = state
                .config_store
                .get_route(id)
                .await?
                .ok_or_else(|| AdminError::NotFound(format!("route {id} not found")))?;
            Ok(json_response(StatusCode::OK, &route))
        }

        (&Method::POST, CUSTOM_PROVIDERS_PATH, None) => create_custom_provider(state, &body).await,
        (&Method::GET, CUSTOM_PROVIDERS_PATH, None) => {
            let providers = state.config_store.list_custom_providers().await?;
            Ok(json_response(StatusCode::OK, &providers))
        }
        (&Method::PATCH, CUSTOM_PROVIDERS_PATH, Some(id)) => {
            update_custom_provider(state, id, &body).await
        }

        (&Method::POST, "/api/reporting/events", None) => handle_aggregate(state, &body).await,
        (&Method::GET, "/api/events", None) => {
            handle_query_events(state, &query_pairs(parts.uri.query())).await
        }

        _ => Err(AdminError::NotFound(format!("no admin route for {} {path}", parts.method))),
    }
}

/// `/api/routes/r1` into (`/api/routes`, Some(`r1`)). Collections are matched
/// whole so ids never contain a slash.
fn split_path(path: &str) -> (&str, Option<&str>) {
    for collection in [KEYS_PATH, SETTINGS_PATH, ROUTES_PATH, CUSTOM_PROVIDERS_PATH] {
        if let Some(rest) = path.strip_prefix(collection) {
            if rest.is_empty() {
                return (collection, None);
            }
            if let Some(id) = rest.strip_prefix('/').filter(|id| !id.is_empty() && !id.contains('/')) {
                return (collection, Some(id));
            }
        }
    }
    (path, None)
}

/// Percent-decoded query pairs.
pub(crate) fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Vec::new();
    };
    match reqwest::Url::parse(&format!("http://admin/?{query}")) {
        Ok(url) => url.query_pairs().into_owned().collect(),
        Err(_) => Vec::new(),
    }
}

pub fn health() -> ProxyResponse {
    json_response(StatusCode::OK, &json!({ "status": "ok" }))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, AdminError> {
    serde_json::from_slice(body).map_err(|e| AdminError::BadRequest(format!("invalid JSON: {e}")))
}

/// Writes are visible to the proxy immediately rather than on the next tick.
async fn refresh_policies(state: &AppState) {
    if let Err(e) = state.policies.refresh_all().await {
        warn!(error = %e, "forced policy cache refresh failed");
    }
}

async fn check_settings_exist(state: &AppState, ids: &[String]) -> Result<(), AdminError> {
    for id in ids {
        if state.config_store.get_setting(id).await?.is_none() {
            return Err(AdminError::BadRequest(format!("provider setting {id} does not exist")));
        }
    }
    Ok(())
}

// === Keys ===

async fn create_key(state: &AppState, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let request: CreateKeyRequest = parse_body(body)?;
    if request.key.trim().is_empty() {
        return Err(AdminError::BadRequest("key must not be empty".into()));
    }
    let key = Key {
        key_id: request
            .key_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        hashed_secret: fingerprint(&request.key),
        name: request.name,
        tags: request.tags,
        ttl: request.ttl.filter(|t| !t.is_empty()),
        cost_limit_in_usd: request.cost_limit_in_usd,
        cost_limit_in_usd_over_time: request.cost_limit_in_usd_over_time,
        cost_limit_in_usd_unit: request.cost_limit_in_usd_unit,
        rate_limit_over_time: request.rate_limit_over_time,
        rate_limit_unit: request.rate_limit_unit,
        setting_ids: request.setting_ids,
        allowed_paths: request.allowed_paths,
        route_id: request.route_id.filter(|r| !r.is_empty()),
        ..Default::default()
    };
    key.validate().map_err(AdminError::BadRequest)?;
    check_settings_exist(state, &key.setting_ids).await?;

    let key = state.config_store.create_key(key).await?;
    info!(key_id = %key.key_id, "key created");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &key))
}

async fn update_key(state: &AppState, key_id: &str, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let update: UpdateKeyRequest = parse_body(body)?;
    let mut key = state
        .config_store
        .get_key(key_id)
        .await?
        .ok_or_else(|| AdminError::NotFound(format!("key {key_id} not found")))?;

    if let Some(name) = update.name {
        key.name = name;
    }
    if let Some(tags) = update.tags {
        key.tags = tags;
    }
    if let Some(revoked) = update.revoked {
        if key.revoked && !revoked {
            return Err(AdminError::BadRequest("a revoked key cannot be restored".into()));
        }
        if revoked && !key.revoked {
            key.revoked = true;
            key.revoked_reason = Some(update.revoked_reason.unwrap_or_else(|| "manual".into()));
        }
    }
    if let Some(limit) = update.cost_limit_in_usd {
        key.cost_limit_in_usd = limit;
    }
    if let Some(limit) = update.cost_limit_in_usd_over_time {
        key.cost_limit_in_usd_over_time = limit;
    }
    if let Some(unit) = update.cost_limit_in_usd_unit {
        key.cost_limit_in_usd_unit = Some(unit);
    }
    if let Some(limit) = update.rate_limit_over_time {
        key.rate_limit_over_time = limit;
    }
    if let Some(unit) = update.rate_limit_unit {
        key.rate_limit_unit = Some(unit);
    }
    if let Some(ids) = update.setting_ids {
        check_settings_exist(state, &ids).await?;
        key.setting_ids = ids;
    }
    if let Some(paths) = update.allowed_paths {
        key.allowed_paths = paths;
    }
    if let Some(route_id) = update.route_id {
        key.route_id = Some(route_id).filter(|r| !r.is_empty());
    }
    key.validate().map_err(AdminError::BadRequest)?;

    let key = state.config_store.update_key(key).await?;
    info!(key_id = %key.key_id, revoked = key.revoked, "key updated");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &key))
}

// === Provider settings ===

async fn create_setting(state: &AppState, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let request: CreateSettingRequest = parse_body(body)?;
    if request.provider.trim().is_empty() {
        return Err(AdminError::BadRequest("provider must not be empty".into()));
    }
    let setting = ProviderSetting {
        id: uuid::Uuid::new_v4().to_string(),
        provider: request.provider,
        name: request.name,
        setting: request.setting,
        ..Default::default()
    };
    if setting.api_key().is_none() {
        return Err(AdminError::BadRequest(format!("setting.{SETTING_API_KEY} is required")));
    }

    let setting = state.config_store.create_setting(setting).await?;
    info!(setting_id = %setting.id, provider = %setting.provider, "provider setting created");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &setting.redacted()))
}

async fn update_setting(state: &AppState, id: &str, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let update: UpdateSettingRequest = parse_body(body)?;
    let mut setting = state
        .config_store
        .get_setting(id)
        .await?
        .ok_or_else(|| AdminError::NotFound(format!("provider setting {id} not found")))?;
    if let Some(name) = update.name {
        setting.name = name;
    }
    setting.setting.extend(update.setting);
    if setting.api_key().is_none() {
        return Err(AdminError::BadRequest(format!("setting.{SETTING_API_KEY} must not be empty")));
    }

    let setting = state.config_store.update_setting(setting).await?;
    info!(setting_id = %setting.id, "provider setting updated");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &setting.redacted()))
}

// === Routes ===

async fn create_route(state: &AppState, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let mut route: Route = parse_body(body)?;
    if route.id.is_empty() {
        route.id = uuid::Uuid::new_v4().to_string();
    }
    route.validate().map_err(AdminError::BadRequest)?;

    let route = state.config_store.create_route(route).await?;
    info!(route_id = %route.id, path = %route.path, "route created");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &route))
}

// === Custom providers ===

async fn create_custom_provider(state: &AppState, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let mut provider: CustomProvider = parse_body(body)?;
    if provider.id.is_empty() {
        provider.id = uuid::Uuid::new_v4().to_string();
    }
    provider.validate().map_err(AdminError::BadRequest)?;

    let provider = state.config_store.create_custom_provider(provider).await?;
    info!(provider = %provider.provider, "custom provider created");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &provider))
}

async fn update_custom_provider(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> Result<ProxyResponse, AdminError> {
    let update: UpdateCustomProviderRequest = parse_body(body)?;
    let mut provider = state
        .config_store
        .get_custom_provider(id)
        .await?
        .ok_or_else(|| AdminError::NotFound(format!("custom provider {id} not found")))?;
    if let Some(configs) = update.route_configs {
        provider.route_configs = configs;
    }
    if let Some(param) = update.authentication_param {
        provider.authentication_param = Some(param).filter(|p| !p.is_empty());
    }
    provider.validate().map_err(AdminError::BadRequest)?;

    let provider = state.config_store.update_custom_provider(provider).await?;
    info!(provider = %provider.provider, "custom provider updated");
    refresh_policies(state).await;
    Ok(json_response(StatusCode::OK, &provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path(KEYS_PATH), (KEYS_PATH, None));
        assert_eq!(split_path("/api/key-management/keys/k1"), (KEYS_PATH, Some("k1")));
        assert_eq!(split_path("/api/routes/r1"), (ROUTES_PATH, Some("r1")));
        assert_eq!(split_path("/api/routes/r1/x"), ("/api/routes/r1/x", None));
        assert_eq!(split_path("/api/custom/providers/p1"), (CUSTOM_PROVIDERS_PATH, Some("p1")));
        assert_eq!(split_path(HEALTH_PATH), (HEALTH_PATH, None));
    }

    #[test]
    fn test_query_pairs_decoded() {
        assert_eq!(
            query_pairs(Some("tag=team%20a&keyIds=k1,k2")),
            vec![
                ("tag".to_string(), "team a".to_string()),
                ("keyIds".to_string(), "k1,k2".to_string())
            ]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn test_store_errors_map_to_status() {
        let conflict: AdminError = StoreError::Conflict("key k1 exists".into()).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let missing: AdminError = StoreError::NotFound("key k1".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.to_string(), "key k1 not found");
    }
}
