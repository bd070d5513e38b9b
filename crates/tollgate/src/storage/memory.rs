use std::collections::HashMap;

use async_trait::async_trait;
use common::models::{unix_now, CustomProvider, Event, Key, ProviderSetting, Route};
use tokio::sync::RwLock;

use super::{ConfigStore, DataPoint, EventQuery, EventStore, ReportingRequest, StoreError};

/// In-process store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    keys: RwLock<HashMap<String, Key>>,
    settings: RwLock<HashMap<String, ProviderSetting>>,
    routes: RwLock<HashMap<String, Route>>,
    custom_providers: RwLock<HashMap<String, CustomProvider>>,
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn updated_since<T: Clone>(
    items: &HashMap<String, T>,
    since: Option<i64>,
    updated_at: impl Fn(&T) -> i64,
) -> Vec<T> {
    items
        .values()
        .filter(|item| since.map_or(true, |s| updated_at(item) >= s))
        .cloned()
        .collect()
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn create_key(&self, mut key: Key) -> Result<Key, StoreError> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(&key.key_id) {
            return Err(StoreError::Conflict(format!("key {} exists", key.key_id)));
        }
        if keys.values().any(|k| k.hashed_secret == key.hashed_secret) {
            return Err(StoreError::Conflict("key secret already registered".into()));
        }
        let now = unix_now();
        key.created_at = now;
        key.updated_at = now;
        keys.insert(key.key_id.clone(), key.clone());
        Ok(key)
    }

    async fn update_key(&self, mut key: Key) -> Result<Key, StoreError> {
        let mut keys = self.keys.write().await;
        let existing = keys
            .get(&key.key_id)
            .ok_or_else(|| StoreError::NotFound(format!("key {}", key.key_id)))?;
        key.created_at = existing.created_at;
        key.hashed_secret = existing.hashed_secret.clone();
        key.updated_at = unix_now().max(existing.updated_at);
        keys.insert(key.key_id.clone(), key.clone());
        Ok(key)
    }

    async fn get_key(&self, key_id: &str) -> Result<Option<Key>, StoreError> {
        Ok(self.keys.read().await.get(key_id).cloned())
    }

    async fn list_keys(&self, tag: Option<&str>) -> Result<Vec<Key>, StoreError> {
        let keys = self.keys.read().await;
        let mut list: Vec<Key> = keys
            .values()
            .filter(|k| tag.map_or(true, |t| k.tags.iter().any(|kt| kt == t)))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_id.cmp(&b.key_id)));
        Ok(list)
    }

    async fn keys_updated_since(&self, since: Option<i64>) -> Result<Vec<Key>, StoreError> {
        Ok(updated_since(&*self.keys.read().await, since, |k| {
            k.updated_at
        }))
    }

    async fn revoke_key(&self, key_id: &str, reason: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.write().await;
        let Some(key) = keys.get_mut(key_id) else {
            return Err(StoreError::NotFound(format!("key {key_id}")));
        };
        if key.revoked {
            return Ok(false);
        }
        key.revoked = true;
        key.revoked_reason = Some(reason.to_string());
        key.updated_at = unix_now().max(key.updated_at);
        Ok(true)
    }

    async fn create_setting(
        &self,
        mut setting: ProviderSetting,
    ) -> Result<ProviderSetting, StoreError> {
        let mut settings = self.settings.write().await;
        if settings.contains_key(&setting.id) {
            return Err(StoreError::Conflict(format!("setting {} exists", setting.id)));
        }
        let now = unix_now();
        setting.created_at = now;
        setting.updated_at = now;
        settings.insert(setting.id.clone(), setting.clone());
        Ok(setting)
    }

    async fn update_setting(
        &self,
        mut setting: ProviderSetting,
    ) -> Result<ProviderSetting, StoreError> {
        let mut settings = self.settings.write().await;
        let existing = settings
            .get(&setting.id)
            .ok_or_else(|| StoreError::NotFound(format!("setting {}", setting.id)))?;
        setting.created_at = existing.created_at;
        setting.updated_at = unix_now().max(existing.updated_at);
        settings.insert(setting.id.clone(), setting.clone());
        Ok(setting)
    }

    async fn get_setting(&self, id: &str) -> Result<Option<ProviderSetting>, StoreError> {
        Ok(self.settings.read().await.get(id).cloned())
    }

    async fn list_settings(&self) -> Result<Vec<ProviderSetting>, StoreError> {
        Ok(self.settings.read().await.values().cloned().collect())
    }

    async fn settings_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<ProviderSetting>, StoreError> {
        Ok(updated_since(&*self.settings.read().await, since, |s| {
            s.updated_at
        }))
    }

    async fn create_route(&self, mut route: Route) -> Result<Route, StoreError> {
        let mut routes = self.routes.write().await;
        if routes.values().any(|r| r.path == route.path || r.id == route.id) {
            return Err(StoreError::Conflict(format!("route {} exists", route.path)));
        }
        let now = unix_now();
        route.created_at = now;
        route.updated_at = now;
        routes.insert(route.id.clone(), route.clone());
        Ok(route)
    }

    async fn get_route(&self, id: &str) -> Result<Option<Route>, StoreError> {
        Ok(self.routes.read().await.get(id).cloned())
    }

    async fn list_routes(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self.routes.read().await.values().cloned().collect())
    }

    async fn routes_updated_since(&self, since: Option<i64>) -> Result<Vec<Route>, StoreError> {
        Ok(updated_since(&*self.routes.read().await, since, |r| {
            r.updated_at
        }))
    }

    async fn create_custom_provider(
        &self,
        mut provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError> {
        let mut providers = self.custom_providers.write().await;
        if providers.values().any(|p| p.provider == provider.provider) {
            return Err(StoreError::Conflict(format!(
                "custom provider {} exists",
                provider.provider
            )));
        }
        let now = unix_now();
        provider.created_at = now;
        provider.updated_at = now;
        providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    async fn update_custom_provider(
        &self,
        mut provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError> {
        let mut providers = self.custom_providers.write().await;
        let existing = providers
            .get(&provider.id)
            .ok_or_else(|| StoreError::NotFound(format!("custom provider {}", provider.id)))?;
        provider.created_at = existing.created_at;
        provider.provider = existing.provider.clone();
        provider.updated_at = unix_now().max(existing.updated_at);
        providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    async fn get_custom_provider(&self, id: &str) -> Result<Option<CustomProvider>, StoreError> {
        Ok(self.custom_providers.read().await.get(id).cloned())
    }

    async fn list_custom_providers(&self) -> Result<Vec<CustomProvider>, StoreError> {
        Ok(self.custom_providers.read().await.values().cloned().collect())
    }

    async fn custom_providers_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<CustomProvider>, StoreError> {
        Ok(updated_since(&*self.custom_providers.read().await, since, |p| {
            p.updated_at
        }))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().await;
        let limit = query.limit.unwrap_or(i64::MAX).max(0) as usize;
        Ok(events
            .iter()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn aggregate_events(
        &self,
        request: &ReportingRequest,
    ) -> Result<Vec<DataPoint>, StoreError> {
        let query = EventQuery {
            key_ids: request.key_ids.clone(),
            tags: request.tags.clone(),
            start: Some(request.start),
            end: Some(request.end),
            ..Default::default()
        };

        let events = self.events.read().await;
        let mut buckets: HashMap<i64, (DataPoint, i64)> = HashMap::new();
        for event in events.iter().filter(|e| query.matches(e)) {
            let ts = request.bucket_of(event.created_at);
            let (point, latency_sum) = buckets.entry(ts).or_insert_with(|| {
                (
                    DataPoint {
                        time_stamp: ts,
                        ..Default::default()
                    },
                    0,
                )
            });
            point.number_of_requests += 1;
            point.cost_in_usd += event.cost_in_usd;
            point.prompt_token_count += event.prompt_token_count;
            point.completion_token_count += event.completion_token_count;
            *latency_sum += event.latency_ms;
        }

        let mut points: Vec<DataPoint> = buckets
            .into_values()
            .map(|(mut point, latency_sum)| {
                point.latency_in_ms = latency_sum as f64 / point.number_of_requests as f64;
                point
            })
            .collect();
        points.sort_by_key(|p| p.time_stamp);
        Ok(points)
    }
}
