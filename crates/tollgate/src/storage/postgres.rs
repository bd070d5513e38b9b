use async_trait::async_trait;
use common::models::{unix_now, CustomProvider, Event, Key, ProviderSetting, Route};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ConfigStore, DataPoint, EventQuery, EventStore, ReportingRequest, StoreError};
use crate::db::queries::{self, PolicyTable};
use crate::db::DbPool;

/// Postgres-backed store. Policy objects live as JSONB documents, events as
/// plain rows.
#[derive(Clone)]
pub struct PostgresStore {
    pool: DbPool,
}

impl PostgresStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn get<T: DeserializeOwned>(
        &self,
        table: PolicyTable,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let client = self.pool.get_client().await?;
        match queries::get_document(&client, table, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        table: PolicyTable,
        since: Option<i64>,
    ) -> Result<Vec<T>, StoreError> {
        let client = self.pool.get_client().await?;
        decode_all(queries::list_documents(&client, table, since).await?)
    }

    async fn update<T: serde::Serialize>(
        &self,
        table: PolicyTable,
        id: &str,
        updated_at: i64,
        item: &T,
    ) -> Result<(), StoreError> {
        let client = self.pool.get_client().await?;
        let data = serde_json::to_value(item)?;
        match queries::update_document(&client, table, id, updated_at, &data).await? {
            0 => Err(StoreError::NotFound(id.to_string())),
            _ => Ok(()),
        }
    }
}

fn decode_all<T: DeserializeOwned>(docs: Vec<Value>) -> Result<Vec<T>, StoreError> {
    docs.into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
        .collect()
}

fn conflict_or(err: tokio_postgres::Error, what: &str) -> StoreError {
    if err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
        StoreError::Conflict(format!("{what} already exists"))
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn create_key(&self, mut key: Key) -> Result<Key, StoreError> {
        let now = unix_now();
        key.created_at = now;
        key.updated_at = now;
        let data = serde_json::to_value(&key)?;
        let client = self.pool.get_client().await?;
        queries::insert_key(&client, &key.key_id, &key.hashed_secret, now, &data)
            .await
            .map_err(|e| conflict_or(e, "key"))?;
        Ok(key)
    }

    async fn update_key(&self, mut key: Key) -> Result<Key, StoreError> {
        let existing = self
            .get_key(&key.key_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("key {}", key.key_id)))?;
        key.created_at = existing.created_at;
        key.hashed_secret = existing.hashed_secret;
        key.updated_at = unix_now().max(existing.updated_at);

        let data = serde_json::to_value(&key)?;
        let client = self.pool.get_client().await?;
        queries::update_key(&client, &key.key_id, key.revoked, key.updated_at, &data).await?;
        Ok(key)
    }

    async fn get_key(&self, key_id: &str) -> Result<Option<Key>, StoreError> {
        self.get(PolicyTable::Keys, key_id).await
    }

    async fn list_keys(&self, tag: Option<&str>) -> Result<Vec<Key>, StoreError> {
        match tag {
            Some(tag) => {
                let client = self.pool.get_client().await?;
                decode_all(queries::list_keys_by_tag(&client, tag).await?)
            }
            None => self.list(PolicyTable::Keys, None).await,
        }
    }

    async fn keys_updated_since(&self, since: Option<i64>) -> Result<Vec<Key>, StoreError> {
        self.list(PolicyTable::Keys, since).await
    }

    async fn revoke_key(&self, key_id: &str, reason: &str) -> Result<bool, StoreError> {
        let client = self.pool.get_client().await?;
        let affected = queries::revoke_key(&client, key_id, reason, unix_now()).await?;
        Ok(affected == 1)
    }

    async fn create_setting(
        &self,
        mut setting: ProviderSetting,
    ) -> Result<ProviderSetting, StoreError> {
        let now = unix_now();
        setting.created_at = now;
        setting.updated_at = now;
        let data = serde_json::to_value(&setting)?;
        let client = self.pool.get_client().await?;
        queries::insert_document(
            &client,
            PolicyTable::ProviderSettings,
            &setting.id,
            Some(("provider", setting.provider.as_str())),
            now,
            &data,
        )
        .await
        .map_err(|e| conflict_or(e, "provider setting"))?;
        Ok(setting)
    }

    async fn update_setting(
        &self,
        mut setting: ProviderSetting,
    ) -> Result<ProviderSetting, StoreError> {
        let existing = self
            .get_setting(&setting.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("setting {}", setting.id)))?;
        setting.created_at = existing.created_at;
        setting.updated_at = unix_now().max(existing.updated_at);
        self.update(
            PolicyTable::ProviderSettings,
            &setting.id,
            setting.updated_at,
            &setting,
        )
        .await?;
        Ok(setting)
    }

    async fn get_setting(&self, id: &str) -> Result<Option<ProviderSetting>, StoreError> {
        self.get(PolicyTable::ProviderSettings, id).await
    }

    async fn list_settings(&self) -> Result<Vec<ProviderSetting>, StoreError> {
        self.list(PolicyTable::ProviderSettings, None).await
    }

    async fn settings_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<ProviderSetting>, StoreError> {
        self.list(PolicyTable::ProviderSettings, since).await
    }

    async fn create_route(&self, mut route: Route) -> Result<Route, StoreError> {
        let now = unix_now();
        route.created_at = now;
        route.updated_at = now;
        let data = serde_json::to_value(&route)?;
        let client = self.pool.get_client().await?;
        queries::insert_document(
            &client,
            PolicyTable::Routes,
            &route.id,
            Some(("path", route.path.as_str())),
            now,
            &data,
        )
        .await
        .map_err(|e| conflict_or(e, "route"))?;
        Ok(route)
    }

    async fn get_route(&self, id: &str) -> Result<Option<Route>, StoreError> {
        self.get(PolicyTable::Routes, id).await
    }

    async fn list_routes(&self) -> Result<Vec<Route>, StoreError> {
        self.list(PolicyTable::Routes, None).await
    }

    async fn routes_updated_since(&self, since: Option<i64>) -> Result<Vec<Route>, StoreError> {
        self.list(PolicyTable::Routes, since).await
    }

    async fn create_custom_provider(
        &self,
        mut provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError> {
        let now = unix_now();
        provider.created_at = now;
        provider.updated_at = now;
        let data = serde_json::to_value(&provider)?;
        let client = self.pool.get_client().await?;
        queries::insert_document(
            &client,
            PolicyTable::CustomProviders,
            &provider.id,
            Some(("provider", provider.provider.as_str())),
            now,
            &data,
        )
        .await
        .map_err(|e| conflict_or(e, "custom provider"))?;
        Ok(provider)
    }

    async fn update_custom_provider(
        &self,
        mut provider: CustomProvider,
    ) -> Result<CustomProvider, StoreError> {
        let existing = self
            .get_custom_provider(&provider.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("custom provider {}", provider.id)))?;
        provider.created_at = existing.created_at;
        provider.provider = existing.provider;
        provider.updated_at = unix_now().max(existing.updated_at);
        self.update(
            PolicyTable::CustomProviders,
            &provider.id,
            provider.updated_at,
            &provider,
        )
        .await?;
        Ok(provider)
    }

    async fn get_custom_provider(&self, id: &str) -> Result<Option<CustomProvider>, StoreError> {
        self.get(PolicyTable::CustomProviders, id).await
    }

    async fn list_custom_providers(&self) -> Result<Vec<CustomProvider>, StoreError> {
        self.list(PolicyTable::CustomProviders, None).await
    }

    async fn custom_providers_updated_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<CustomProvider>, StoreError> {
        self.list(PolicyTable::CustomProviders, since).await
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        let client = self.pool.get_client().await?;
        queries::insert_event(&client, event).await?;
        Ok(())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let client = self.pool.get_client().await?;
        Ok(queries::query_events(&client, query).await?)
    }

    async fn aggregate_events(
        &self,
        request: &ReportingRequest,
    ) -> Result<Vec<DataPoint>, StoreError> {
        let client = self.pool.get_client().await?;
        Ok(queries::aggregate_events(&client, request).await?)
    }
}
