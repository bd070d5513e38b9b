//! System-of-record for policy objects and the append-only event log.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use common::models::{CustomProvider, Event, Key, ProviderSetting, Route};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("failed to get db connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("failed to decode stored record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Filters for `GET /api/events`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    pub custom_id: Option<String>,
    #[serde(default)]
    pub key_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        self.custom_id
            .as_ref()
            .map_or(true, |id| event.custom_id.as_ref() == Some(id))
            && (self.key_ids.is_empty() || self.key_ids.contains(&event.key_id))
            && (self.tags.is_empty() || self.tags.iter().any(|t| event.tags.contains(t)))
            && self.start.map_or(true, |start| event.created_at >= start)
            && self.end.map_or(true, |end| event.created_at < end)
    }
}

/// Body of `POST /api/reporting/events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingRequest {
    #[serde(default)]
    pub key_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub start: i64,
    pub end: i64,
    pub increment: i64,
}

impl ReportingRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.increment <= 0 {
            return Err("increment must be positive".to_string());
        }
        if self.end <= self.start {
            return Err("end must be after start".to_string());
        }
        Ok(())
    }

    pub fn bucket_of(&self, created_at: i64) -> i64 {
        self.start + (created_at - self.start).div_euclid(self.increment) * self.increment
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub time_stamp: i64,
    pub number_of_requests: i64,
    pub cost_in_usd: f64,
    pub latency_in_ms: f64,
    pub prompt_token_count: i64,
    pub completion_token_count: i64,
}

/// Keys, provider settings, routes and custom providers. Every write stamps
/// `updated_at`, which the policy cache uses for incremental refreshes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn create_key(&self, key: Key) -> Result<Key, StoreError>;
    async fn update_key(&self, key: Key) -> Result<Key, StoreError>;
    async fn get_key(&self, key_id: &str) -> Result<Option<Key>, StoreError>;
    async fn list_keys(&self, tag: Option<&str>) -> Result<Vec<Key>, StoreError>;
    async fn keys_updated_since(&self, since: Option<i64>) -> Result<Vec<Key>, StoreError>;
    /// Flip `revoked` from false to true. Returns whether this call made the
    /// transition, so concurrent callers revoke a key exactly once.
    async fn revoke_key(&self, key_id: &str, reason: &str) -> Result<bool, StoreError>;

    async fn create_setting(&self, setting: ProviderSetting) -> Result<ProviderSetting, StoreError>;
    async fn update_setting(&self, setting: ProviderSetting) -> Result<ProviderSetting, StoreError>;
    async fn get_setting(&self, id: &str) -> Result<Option<ProviderSetting>, StoreError>;
    async fn list_settings(&self) -> Result<Vec<ProviderSetting>, StoreError>;
    async fn settings_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<ProviderSetting>, StoreError>;

    async fn create_route(&self, route: Route) -> Result<Route, StoreError>;
    async fn get_route(&self, id: &str) -> Result<Option<Route>, StoreError>;
    async fn list_routes(&self) -> Result<Vec<Route>, StoreError>;
    async fn routes_updated_since(&self, since: Option<i64>) -> Result<Vec<Route>, StoreError>;

    async fn create_custom_provider(
        &self,
        provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError>;
    async fn update_custom_provider(
        &self,
        provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError>;
    async fn get_custom_provider(&self, id: &str) -> Result<Option<CustomProvider>, StoreError>;
    async fn list_custom_providers(&self) -> Result<Vec<CustomProvider>, StoreError>;
    async fn custom_providers_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<CustomProvider>, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError>;
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError>;
    async fn aggregate_events(&self, request: &ReportingRequest)
        -> Result<Vec<DataPoint>, StoreError>;
}
