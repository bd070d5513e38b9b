//! In-memory view of keys, provider settings, routes and custom providers,
//! kept current by incremental refreshes from the config store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::models::{CustomProvider, Key, ProviderSetting, Route};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::storage::{ConfigStore, StoreError};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Something the cache can index and order by freshness.
pub trait Cached: Clone + PartialEq + Send + Sync + 'static {
    fn cache_key(&self) -> &str;
    fn updated_at(&self) -> i64;
}

impl Cached for Key {
    fn cache_key(&self) -> &str {
        &self.hashed_secret
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Cached for ProviderSetting {
    fn cache_key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Cached for Route {
    fn cache_key(&self) -> &str {
        &self.path
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Cached for CustomProvider {
    fn cache_key(&self) -> &str {
        &self.provider
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

struct SubCache<T> {
    entries: RwLock<HashMap<String, T>>,
    /// Newest `updated_at` merged so far, -1 before the first load.
    watermark: AtomicI64,
}

impl<T: Cached> SubCache<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            watermark: AtomicI64::new(-1),
        }
    }

    fn since(&self) -> Option<i64> {
        let watermark = self.watermark.load(Ordering::Acquire);
        (watermark >= 0).then_some(watermark)
    }

    async fn get(&self, key: &str) -> Option<T> {
        self.entries.read().await.get(key).cloned()
    }

    async fn values(&self) -> Vec<T> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Apply a batch of changed records; an entry is only replaced by one at
    /// least as fresh. Returns how many entries changed.
    async fn merge(&self, items: Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut newest = self.watermark.load(Ordering::Acquire);
        let mut changed = 0;
        let mut entries = self.entries.write().await;
        for item in items {
            newest = newest.max(item.updated_at());
            match entries.get(item.cache_key()) {
                Some(current) if current.updated_at() > item.updated_at() || *current == item => {
                    continue
                }
                _ => {}
            }
            entries.insert(item.cache_key().to_string(), item);
            changed += 1;
        }
        self.watermark.fetch_max(newest, Ordering::AcqRel);
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Keys,
    Settings,
    Routes,
    CustomProviders,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Keys,
        Section::Settings,
        Section::Routes,
        Section::CustomProviders,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Section::Keys => "keys",
            Section::Settings => "provider_settings",
            Section::Routes => "routes",
            Section::CustomProviders => "custom_providers",
        }
    }
}

pub struct PolicyCache {
    store: Arc<dyn ConfigStore>,
    keys: SubCache<Key>,
    settings: SubCache<ProviderSetting>,
    routes: SubCache<Route>,
    custom_providers: SubCache<CustomProvider>,
}

impl PolicyCache {
    /// Build the cache from a full read of the store. Any failure here is a
    /// bootstrap failure.
    pub async fn load(store: Arc<dyn ConfigStore>) -> Result<Arc<Self>, StoreError> {
        let cache = Arc::new(Self {
            store,
            keys: SubCache::new(),
            settings: SubCache::new(),
            routes: SubCache::new(),
            custom_providers: SubCache::new(),
        });
        for section in Section::ALL {
            let loaded = cache.refresh(section).await?;
            info!(cache = section.name(), entries = loaded, "policy cache loaded");
        }
        Ok(cache)
    }

    /// Pull everything changed since the last refresh of `section`.
    pub async fn refresh(&self, section: Section) -> Result<usize, StoreError> {
        let changed = match section {
            Section::Keys => {
                let items = self.store.keys_updated_since(self.keys.since()).await?;
                self.keys.merge(items).await
            }
            Section::Settings => {
                let items = self
                    .store
                    .settings_updated_since(self.settings.since())
                    .await?;
                self.settings.merge(items).await
            }
            Section::Routes => {
                let items = self.store.routes_updated_since(self.routes.since()).await?;
                self.routes.merge(items).await
            }
            Section::CustomProviders => {
                let items = self
                    .store
                    .custom_providers_updated_since(self.custom_providers.since())
                    .await?;
                self.custom_providers.merge(items).await
            }
        };
        Ok(changed)
    }

    /// Forced refresh of every section, used after admin writes.
    pub async fn refresh_all(&self) -> Result<(), StoreError> {
        for section in Section::ALL {
            self.refresh(section).await?;
        }
        Ok(())
    }

    /// Spawn one refresher per section. Each stops when `cancel` fires.
    pub fn start_refreshers(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        Section::ALL
            .into_iter()
            .map(|section| {
                let cache = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { cache.run_refresher(section, interval, cancel).await })
            })
            .collect()
    }

    async fn run_refresher(&self, section: Section, interval: Duration, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(cache = section.name(), "policy cache refresher stopped");
                    return;
                }
                _ = tokio::time::sleep(backoff(interval, failures)) => {}
            }

            match self.refresh(section).await {
                Ok(changed) => {
                    failures = 0;
                    if changed > 0 {
                        debug!(cache = section.name(), changed, "policy cache refreshed");
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::counter!("policy_cache.refresh_errors", "cache" => section.name())
                        .increment(1);
                    error!(cache = section.name(), failures, error = %e, "policy cache refresh failed, serving previous snapshot");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub async fn key_by_hash(&self, hashed_secret: &str) -> Option<Key> {
        self.keys.get(hashed_secret).await
    }

    pub async fn setting(&self, id: &str) -> Option<ProviderSetting> {
        self.settings.get(id).await
    }

    /// The key's provider settings that are currently known, in the order the
    /// key lists them.
    pub async fn settings_for(&self, key: &Key) -> Vec<ProviderSetting> {
        let entries = self.settings.entries.read().await;
        key.setting_ids
            .iter()
            .filter_map(|id| entries.get(id).cloned())
            .collect()
    }

    pub async fn route_by_path(&self, path: &str) -> Option<Route> {
        self.routes.get(path).await
    }

    pub async fn custom_provider(&self, name: &str) -> Option<CustomProvider> {
        self.custom_providers.get(name).await
    }

    pub async fn keys(&self) -> Vec<Key> {
        self.keys.values().await
    }

    /// Revoke in the store and locally. Returns whether this call performed
    /// the transition; concurrent callers see `false`.
    pub async fn revoke_key(&self, key: &Key, reason: &str) -> Result<bool, StoreError> {
        let revoked = self.store.revoke_key(&key.key_id, reason).await?;
        self.mark_key_revoked(&key.hashed_secret, reason).await;
        if revoked {
            metrics::counter!("policy_cache.keys_revoked").increment(1);
            info!(key_id = %key.key_id, reason, "key revoked");
        }
        Ok(revoked)
    }

    /// Reflect a revocation locally without waiting for the next refresh.
    pub async fn mark_key_revoked(&self, hashed_secret: &str, reason: &str) {
        let mut entries = self.keys.entries.write().await;
        if let Some(key) = entries.get_mut(hashed_secret) {
            key.revoked = true;
            key.revoked_reason = Some(reason.to_string());
        }
    }
}

fn backoff(interval: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    interval
        .saturating_mul(2u32.saturating_pow(failures.min(16)))
        .min(MAX_BACKOFF.max(interval))
}
