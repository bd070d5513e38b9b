//! Virtual-key authentication and path authorization.

pub mod credentials;

use std::collections::HashSet;
use std::sync::Arc;

use common::consts::{
    ANTHROPIC_PREFIX, ANTHROPIC_PROVIDER, AZURE_PREFIX, AZURE_PROVIDER, CUSTOM_PROVIDERS_PREFIX,
    OPENAI_PREFIX, OPENAI_PROVIDER, ROUTES_PREFIX,
};
use common::errors::ProxyError;
use common::models::{CustomProvider, Key, ProviderSetting, Route, RouteConfig};
use hyper::HeaderMap;
use rand::seq::IndexedRandom;
use tracing::debug;

pub use credentials::{apply_upstream_credential, extract_virtual_key, fingerprint};

use crate::policy::PolicyCache;

/// Where an inbound proxy path is headed.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One of the built-in providers; `upstream_path` is the provider-relative
    /// path, e.g. `/v1/chat/completions`.
    Provider {
        provider: &'static str,
        upstream_path: String,
    },
    Route(Route),
    Custom {
        provider: CustomProvider,
        config: RouteConfig,
    },
}

impl Target {
    pub fn provider_name(&self) -> &str {
        match self {
            Target::Provider { provider, .. } => provider,
            Target::Route(_) => "route",
            Target::Custom { provider, .. } => &provider.provider,
        }
    }
}

/// An authenticated request: the key, the settings it may use for this
/// target, and the target itself.
#[derive(Debug, Clone)]
pub struct Admission {
    pub key: Key,
    /// For built-in and custom providers the first entry is the selected
    /// setting. For routes, every setting the key holds.
    pub settings: Vec<ProviderSetting>,
    pub target: Target,
}

impl Admission {
    pub fn selected_setting(&self) -> Option<&ProviderSetting> {
        self.settings.first()
    }
}

enum Ingress<'a> {
    Provider(&'static str, &'a str),
    Route(&'a str),
    Custom(&'a str, &'a str),
}

fn classify(path: &str) -> Option<Ingress<'_>> {
    let under = |prefix: &str| {
        path.strip_prefix(prefix)
            .filter(|rest| rest.starts_with('/'))
    };

    if let Some(rest) = under(AZURE_PREFIX) {
        return Some(Ingress::Provider(AZURE_PROVIDER, rest));
    }
    if let Some(rest) = under(OPENAI_PREFIX) {
        return Some(Ingress::Provider(OPENAI_PROVIDER, rest));
    }
    if let Some(rest) = under(ANTHROPIC_PREFIX) {
        return Some(Ingress::Provider(ANTHROPIC_PROVIDER, rest));
    }
    if let Some(rest) = under(ROUTES_PREFIX) {
        return Some(Ingress::Route(rest));
    }
    if let Some(rest) = under(CUSTOM_PROVIDERS_PREFIX) {
        let rest = &rest[1..];
        let (name, sub_path) = rest.split_at(rest.find('/')?);
        if name.is_empty() {
            return None;
        }
        return Some(Ingress::Custom(name, sub_path));
    }
    None
}

#[derive(Clone)]
pub struct Authenticator {
    policies: Arc<PolicyCache>,
}

impl Authenticator {
    pub fn new(policies: Arc<PolicyCache>) -> Self {
        Self { policies }
    }

    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Admission, ProxyError> {
        let secret = extract_virtual_key(headers)
            .ok_or_else(|| ProxyError::Auth("api key not found".into()))?;

        let key = self
            .policies
            .key_by_hash(&fingerprint(secret))
            .await
            .filter(|k| !k.revoked)
            .ok_or_else(|| ProxyError::Auth("not authorized".into()))?;

        if !key.allows_path(method, path) {
            debug!(key_id = %key.key_id, method, path, "path not in key allow-list");
            return Err(ProxyError::Auth("path is not allowed for this key".into()));
        }

        let ingress = classify(path)
            .ok_or_else(|| ProxyError::NotFound(format!("no proxy route for {path}")))?;
        let settings = self.policies.settings_for(&key).await;

        match ingress {
            Ingress::Provider(provider, upstream_path) => {
                let setting = pick_setting(&settings, provider).ok_or_else(|| {
                    ProxyError::Auth(format!("key is not authorized for {provider}"))
                })?;
                Ok(Admission {
                    key,
                    settings: vec![setting],
                    target: Target::Provider {
                        provider,
                        upstream_path: upstream_path.to_string(),
                    },
                })
            }
            Ingress::Route(route_path) => {
                let route = self
                    .policies
                    .route_by_path(route_path)
                    .await
                    .ok_or_else(|| ProxyError::NotFound(format!("route {route_path} not found")))?;
                authorize_route(&key, &route, &settings)?;
                Ok(Admission {
                    key,
                    settings,
                    target: Target::Route(route),
                })
            }
            Ingress::Custom(name, sub_path) => {
                let provider = self.policies.custom_provider(name).await.ok_or_else(|| {
                    ProxyError::NotFound(format!("custom provider {name} not found"))
                })?;
                let config = provider.route_config(sub_path).cloned().ok_or_else(|| {
                    ProxyError::NotFound(format!("custom provider {name} has no route {sub_path}"))
                })?;
                let setting = pick_setting(&settings, name).ok_or_else(|| {
                    ProxyError::Auth(format!("key is not authorized for {name}"))
                })?;
                Ok(Admission {
                    key,
                    settings: vec![setting],
                    target: Target::Custom { provider, config },
                })
            }
        }
    }
}

/// Random pick among the key's settings for `provider`, spreading load
/// across upstream accounts.
fn pick_setting(settings: &[ProviderSetting], provider: &str) -> Option<ProviderSetting> {
    let matching: Vec<&ProviderSetting> =
        settings.iter().filter(|s| s.provider == provider).collect();
    matching.choose(&mut rand::rng()).map(|s| (*s).clone())
}

fn authorize_route(key: &Key, route: &Route, settings: &[ProviderSetting]) -> Result<(), ProxyError> {
    if !route.permits(&key.key_id) {
        return Err(ProxyError::Auth("key is not allowed to use this route".into()));
    }
    if key.route_id.as_deref().is_some_and(|id| id != route.id) {
        return Err(ProxyError::Auth("key is bound to a different route".into()));
    }
    let covered: HashSet<&str> = settings.iter().map(|s| s.provider.as_str()).collect();
    if let Some(step) = route
        .steps
        .iter()
        .find(|step| !covered.contains(step.provider.as_str()))
    {
        return Err(ProxyError::Auth(format!(
            "key has no provider setting for route step {}",
            step.provider
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::ConfigStore;
    use common::models::{RouteStep, SETTING_API_KEY};
    use hyper::header::{HeaderValue, AUTHORIZATION};
    use std::collections::HashMap;

    fn setting(id: &str, provider: &str) -> ProviderSetting {
        ProviderSetting {
            id: id.into(),
            provider: provider.into(),
            setting: HashMap::from([(SETTING_API_KEY.to_string(), format!("{id}-secret"))]),
            ..Default::default()
        }
    }

    fn step(provider: &str) -> RouteStep {
        RouteStep {
            provider: provider.into(),
            model: "m".into(),
            timeout: "2s".into(),
            ..Default::default()
        }
    }

    fn bearer(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}")).unwrap(),
        );
        headers
    }

    async fn authenticator() -> (Authenticator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.create_setting(setting("s-openai", "openai")).await.unwrap();
        store
            .create_setting(setting("s-anthropic", "anthropic"))
            .await
            .unwrap();
        store.create_setting(setting("s-custom", "my-llm")).await.unwrap();
        store
            .create_key(Key {
                key_id: "k1".into(),
                name: "openai only".into(),
                hashed_secret: fingerprint("sk-openai"),
                setting_ids: vec!["s-openai".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_key(Key {
                key_id: "k2".into(),
                name: "both".into(),
                hashed_secret: fingerprint("sk-both"),
                setting_ids: vec!["s-openai".into(), "s-anthropic".into(), "s-custom".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_route(Route {
                id: "r1".into(),
                path: "/chat".into(),
                key_ids: vec!["k1".into(), "k2".into()],
                steps: vec![step("openai"), step("anthropic")],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_custom_provider(CustomProvider {
                id: "c1".into(),
                provider: "my-llm".into(),
                route_configs: vec![RouteConfig {
                    path: "/v1/generate".into(),
                    target_url: "http://localhost/generate".into(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let cache = PolicyCache::load(store.clone()).await.unwrap();
        (Authenticator::new(cache), store)
    }

    #[tokio::test]
    async fn test_builtin_provider_admission() {
        let (auth, _) = authenticator().await;
        let admission = auth
            .authenticate(
                "POST",
                "/api/providers/openai/v1/chat/completions",
                &bearer("sk-openai"),
            )
            .await
            .unwrap();
        assert_eq!(admission.key.key_id, "k1");
        assert_eq!(admission.selected_setting().unwrap().id, "s-openai");
        assert_eq!(
            admission.target,
            Target::Provider {
                provider: "openai",
                upstream_path: "/v1/chat/completions".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_and_missing_keys() {
        let (auth, _) = authenticator().await;
        let path = "/api/providers/openai/v1/chat/completions";
        let err = auth.authenticate("POST", path, &HeaderMap::new()).await.unwrap_err();
        assert_eq!(err, ProxyError::Auth("api key not found".into()));

        let err = auth.authenticate("POST", path, &bearer("sk-nope")).await.unwrap_err();
        assert_eq!(err, ProxyError::Auth("not authorized".into()));
    }

    #[tokio::test]
    async fn test_revoked_key_is_rejected() {
        let (auth, store) = authenticator().await;
        store.revoke_key("k1", "manual").await.unwrap();
        auth.policies.refresh_all().await.unwrap();
        let err = auth
            .authenticate(
                "POST",
                "/api/providers/openai/v1/chat/completions",
                &bearer("sk-openai"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn test_wrong_namespace_is_auth_error() {
        let (auth, _) = authenticator().await;
        for path in [
            "/api/providers/anthropic/v1/complete",
            "/api/providers/azure/openai/deployments/d1/chat/completions",
        ] {
            let err = auth
                .authenticate("POST", path, &bearer("sk-openai"))
                .await
                .unwrap_err();
            assert!(matches!(err, ProxyError::Auth(_)), "{path}");
        }
    }

    #[tokio::test]
    async fn test_route_requires_step_coverage() {
        let (auth, _) = authenticator().await;
        let err = auth
            .authenticate("POST", "/api/routes/chat", &bearer("sk-openai"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));

        let admission = auth
            .authenticate("POST", "/api/routes/chat", &bearer("sk-both"))
            .await
            .unwrap();
        assert!(matches!(admission.target, Target::Route(ref r) if r.id == "r1"));
        assert_eq!(admission.settings.len(), 3);

        let err = auth
            .authenticate("POST", "/api/routes/unknown", &bearer("sk-both"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_custom_provider_admission() {
        let (auth, _) = authenticator().await;
        let admission = auth
            .authenticate(
                "POST",
                "/api/custom/providers/my-llm/v1/generate",
                &bearer("sk-both"),
            )
            .await
            .unwrap();
        assert_eq!(admission.selected_setting().unwrap().id, "s-custom");
        assert!(
            matches!(admission.target, Target::Custom { ref config, .. } if config.path == "/v1/generate")
        );

        let err = auth
            .authenticate(
                "POST",
                "/api/custom/providers/my-llm/v1/generate",
                &bearer("sk-openai"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn test_allowed_paths() {
        let (auth, store) = authenticator().await;
        let mut key = store.get_key("k1").await.unwrap().unwrap();
        key.allowed_paths = vec![common::models::AllowedPath {
            method: "POST".into(),
            path: "/api/providers/openai/v1/embeddings".into(),
        }];
        store.update_key(key).await.unwrap();
        auth.policies.refresh_all().await.unwrap();

        let err = auth
            .authenticate(
                "POST",
                "/api/providers/openai/v1/chat/completions",
                &bearer("sk-openai"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
        assert!(auth
            .authenticate(
                "POST",
                "/api/providers/openai/v1/embeddings",
                &bearer("sk-openai"),
            )
            .await
            .is_ok());
    }

    #[test]
    fn test_classify_rejects_lookalike_prefixes() {
        assert!(classify("/api/providers/openaiX/v1/chat").is_none());
        assert!(classify("/api/custom/providers/only-name").is_none());
        assert!(matches!(
            classify("/api/providers/azure/openai/deployments/d/embeddings"),
            Some(Ingress::Provider("azure", "/deployments/d/embeddings"))
        ));
    }
}
