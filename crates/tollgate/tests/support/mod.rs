#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use common::configuration::{Configuration, UpstreamConfig};
use common::models::{Key, ProviderSetting, Route};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use llmcost::TokenCounter;
use serde_json::Value;
use tokio::sync::mpsc;
use tollgate::app_state::AppState;
use tollgate::auth::{fingerprint, Authenticator};
use tollgate::billing::{MemoryAccessCache, MemoryCounters, Recorder, Validator};
use tollgate::events::{AccountingHandler, Decorator, EventBus, Message, MessageHandler, Topic};
use tollgate::handlers::{handle_admin, handle_proxy};
use tollgate::handlers::response::ProxyResponse;
use tollgate::handlers::routes::response_cache;
use tollgate::policy::PolicyCache;
use tollgate::storage::memory::MemoryStore;
use tollgate::storage::{ConfigStore, EventQuery, EventStore};

pub const SECRET: &str = "sk-test";

/// A proxy wired to in-memory stores and counters, with the consumer side
/// driven by hand through `drain`.
pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub policies: Arc<PolicyCache>,
    handler: AccountingHandler,
    subscriptions: Vec<mpsc::Receiver<Arc<Message>>>,
}

pub fn openai_setting(id: &str) -> ProviderSetting {
    setting(id, "openai", "upstream")
}

pub fn setting(id: &str, provider: &str, apikey: &str) -> ProviderSetting {
    ProviderSetting {
        id: id.to_string(),
        provider: provider.to_string(),
        name: format!("{provider} account"),
        setting: [("apikey".to_string(), apikey.to_string())].into(),
        ..Default::default()
    }
}

pub fn key(setting_ids: &[&str]) -> Key {
    Key {
        key_id: "k1".to_string(),
        hashed_secret: fingerprint(SECRET),
        name: "integration".to_string(),
        setting_ids: setting_ids.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

impl Harness {
    pub async fn new(
        upstream_url: &str,
        key: Key,
        settings: Vec<ProviderSetting>,
        routes: Vec<Route>,
    ) -> Self {
        Self::with_config(upstream_url, key, settings, routes, Configuration::default()).await
    }

    /// Like `new`, starting from `config` instead of the defaults. Upstream
    /// base URLs are always pointed at `upstream_url`.
    pub async fn with_config(
        upstream_url: &str,
        key: Key,
        settings: Vec<ProviderSetting>,
        routes: Vec<Route>,
        config: Configuration,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        for setting in settings {
            store.create_setting(setting).await.unwrap();
        }
        for route in routes {
            store.create_route(route).await.unwrap();
        }
        store.create_key(key).await.unwrap();

        let config = Configuration {
            upstream: UpstreamConfig {
                openai_base_url: upstream_url.to_string(),
                anthropic_base_url: upstream_url.to_string(),
                azure_base_url: Some(upstream_url.to_string()),
                ..Default::default()
            },
            ..config
        };

        let counters = Arc::new(MemoryCounters::new());
        let access = Arc::new(MemoryAccessCache::new());
        let policies = PolicyCache::load(store.clone()).await.unwrap();
        let decorator = Decorator::new(Arc::new(TokenCounter::new().unwrap()));
        let validator = Validator::new(counters.clone(), access.clone());

        let bus = Arc::new(EventBus::new());
        let subscriptions = vec![
            bus.subscribe(Topic::Event, 64),
            bus.subscribe(Topic::RequestContent, 64),
        ];
        let handler = AccountingHandler::new(
            decorator.clone(),
            Recorder::new(store.clone(), counters.clone()),
            validator.clone(),
            access,
            policies.clone(),
        );

        let state = Arc::new(AppState {
            config: Arc::new(config),
            config_store: store.clone(),
            event_store: store.clone(),
            authenticator: Authenticator::new(policies.clone()),
            policies: policies.clone(),
            validator,
            decorator,
            bus,
            http_client: reqwest::Client::new(),
            response_cache: response_cache(),
        });

        Self {
            state,
            store,
            policies,
            handler,
            subscriptions,
        }
    }

    pub async fn post(&self, path: &str, body: Value) -> ProxyResponse {
        self.post_with_secret(path, SECRET, body).await
    }

    pub async fn post_with_secret(&self, path: &str, secret: &str, body: Value) -> ProxyResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("authorization", format!("Bearer {secret}"))
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        handle_proxy(request, Arc::clone(&self.state)).await.unwrap()
    }

    pub async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        read_json(handle_admin(request, Arc::clone(&self.state)).await.unwrap()).await
    }

    /// Run every queued message through the accounting handler.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        for rx in &mut self.subscriptions {
            while let Ok(message) = rx.try_recv() {
                self.handler.handle(message).await;
                handled += 1;
            }
        }
        handled
    }

    pub async fn events(&self) -> Vec<common::models::Event> {
        self.store.query_events(&EventQuery::default()).await.unwrap()
    }
}

pub async fn read_json(response: ProxyResponse) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}
