use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::window::WindowUnit;

/// Parse a duration string such as `500ms`, `2s` or `1h`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    value
        .parse::<DurationString>()
        .map(Duration::from)
        .map_err(|e| format!("invalid duration '{value}': {e}"))
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedPath {
    pub method: String,
    pub path: String,
}

/// Policy attached to a virtual key. Only the fingerprint of the client
/// secret is ever held.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub key_id: String,
    pub hashed_secret: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub revoked: bool,
    pub revoked_reason: Option<String>,
    pub ttl: Option<String>,
    #[serde(default)]
    pub cost_limit_in_usd: f64,
    #[serde(default)]
    pub cost_limit_in_usd_over_time: f64,
    pub cost_limit_in_usd_unit: Option<WindowUnit>,
    #[serde(default)]
    pub rate_limit_over_time: i64,
    pub rate_limit_unit: Option<WindowUnit>,
    #[serde(default)]
    pub setting_ids: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<AllowedPath>,
    pub route_id: Option<String>,
}

impl Key {
    pub fn ttl_duration(&self) -> Result<Option<Duration>, String> {
        match self.ttl.as_deref() {
            None | Some("") => Ok(None),
            Some(ttl) => parse_duration(ttl).map(Some),
        }
    }

    /// True once `created_at + ttl` lies in the past. Keys without a ttl
    /// (or with an unparseable one) never expire.
    pub fn is_expired(&self, now: i64) -> bool {
        match self.ttl_duration() {
            Ok(Some(ttl)) => now > self.created_at + ttl.as_secs() as i64,
            _ => false,
        }
    }

    pub fn allows_path(&self, method: &str, path: &str) -> bool {
        self.allowed_paths.is_empty()
            || self
                .allowed_paths
                .iter()
                .any(|p| p.method.eq_ignore_ascii_case(method) && p.path == path)
    }

    /// Check the structural invariants a stored key must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.cost_limit_in_usd < 0.0
            || self.cost_limit_in_usd_over_time < 0.0
            || self.rate_limit_over_time < 0
        {
            return Err("limits must not be negative".to_string());
        }
        match (self.rate_limit_over_time > 0, self.rate_limit_unit) {
            (true, None) => return Err("rateLimitUnit is required with rateLimitOverTime".into()),
            (false, Some(_)) => {
                return Err("rateLimitOverTime is required with rateLimitUnit".into())
            }
            _ => {}
        }
        match (
            self.cost_limit_in_usd_over_time > 0.0,
            self.cost_limit_in_usd_unit,
        ) {
            (true, None) => {
                return Err("costLimitInUsdUnit is required with costLimitInUsdOverTime".into())
            }
            (false, Some(_)) => {
                return Err("costLimitInUsdOverTime is required with costLimitInUsdUnit".into())
            }
            (true, Some(unit)) if !unit.is_cost_unit() => {
                return Err("costLimitInUsdUnit must be one of h, d".into())
            }
            _ => {}
        }
        self.ttl_duration()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider settings
// ---------------------------------------------------------------------------

pub const SETTING_API_KEY: &str = "apikey";
pub const SETTING_RESOURCE_NAME: &str = "resourceName";
pub const SETTING_API_VERSION: &str = "apiVersion";
pub const SETTING_DEPLOYMENT_ID: &str = "deploymentId";

/// Credentials and parameters for one upstream provider.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSetting {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub setting: HashMap<String, String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ProviderSetting {
    pub fn api_key(&self) -> Option<&str> {
        self.param(SETTING_API_KEY)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.setting
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Copy safe to hand back to admin clients.
    pub fn redacted(&self) -> ProviderSetting {
        let mut copy = self.clone();
        if let Some(secret) = copy.setting.get_mut(SETTING_API_KEY) {
            *secret = "*****".to_string();
        }
        copy
    }
}

impl fmt::Debug for ProviderSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = self.redacted();
        f.debug_struct("ProviderSetting")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("setting", &redacted.setting)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStep {
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub retries: u32,
    pub timeout: String,
}

impl RouteStep {
    /// Number of dispatch attempts; zero retries still dispatches once.
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn timeout_duration(&self) -> Result<Duration, String> {
        let timeout = parse_duration(&self.timeout)?;
        if timeout.is_zero() {
            return Err("step timeout must be positive".to_string());
        }
        Ok(timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ttl: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key_ids: Vec<String>,
    pub steps: Vec<RouteStep>,
    pub cache_config: Option<CacheConfig>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Route {
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.starts_with('/') {
            return Err("path must start with '/'".to_string());
        }
        if self.steps.is_empty() {
            return Err("a route needs at least one step".to_string());
        }
        for step in &self.steps {
            if step.provider.is_empty() {
                return Err("every step needs a provider".to_string());
            }
            step.timeout_duration()?;
        }
        if let Some(cache) = self.cache_config.as_ref().filter(|c| c.enabled) {
            parse_duration(&cache.ttl)?;
        }
        Ok(())
    }

    pub fn permits(&self, key_id: &str) -> bool {
        self.key_ids.iter().any(|id| id == key_id)
    }
}

// ---------------------------------------------------------------------------
// Custom providers
// ---------------------------------------------------------------------------

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub path: String,
    pub target_url: String,
    pub model_location: Option<String>,
    pub request_prompt_location: Option<String>,
    pub response_completion_location: Option<String>,
    pub stream_location: Option<String>,
    pub stream_response_completion_location: Option<String>,
    pub stream_end_word: Option<String>,
    pub stream_max_empty_messages: Option<u32>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProvider {
    #[serde(default)]
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub route_configs: Vec<RouteConfig>,
    pub authentication_param: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl CustomProvider {
    pub fn route_config(&self, path: &str) -> Option<&RouteConfig> {
        self.route_configs.iter().find(|rc| rc.path == path)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.provider.is_empty() {
            return Err("provider must not be empty".to_string());
        }
        for rc in &self.route_configs {
            if !rc.path.starts_with('/') {
                return Err(format!("route config path '{}' must start with '/'", rc.path));
            }
            if rc.target_url.is_empty() {
                return Err(format!("route config '{}' needs a targetUrl", rc.path));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One accounted request. Append-only.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub created_at: i64,
    pub key_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub provider: String,
    pub model: String,
    pub path: String,
    pub method: String,
    pub status: u16,
    pub prompt_token_count: i64,
    pub completion_token_count: i64,
    pub cost_in_usd: f64,
    pub latency_ms: i64,
    pub custom_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_key() -> Key {
        Key {
            key_id: "k1".to_string(),
            hashed_secret: "abc".to_string(),
            name: "test".to_string(),
            created_at: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_expiration() {
        let mut key = test_key();
        assert!(!key.is_expired(10_000));

        key.ttl = Some("1s".to_string());
        assert!(!key.is_expired(1_001));
        assert!(key.is_expired(1_002));
    }

    #[test]
    fn test_key_validate_unit_pairs() {
        let mut key = test_key();
        key.rate_limit_over_time = 2;
        assert!(key.validate().is_err());
        key.rate_limit_unit = Some(WindowUnit::Minute);
        assert!(key.validate().is_ok());

        key.cost_limit_in_usd_over_time = 1.0;
        key.cost_limit_in_usd_unit = Some(WindowUnit::Minute);
        assert!(key.validate().is_err());
        key.cost_limit_in_usd_unit = Some(WindowUnit::Day);
        assert!(key.validate().is_ok());

        key.ttl = Some("soon".to_string());
        assert!(key.validate().is_err());
    }

    #[test]
    fn test_allowed_paths() {
        let mut key = test_key();
        assert!(key.allows_path("POST", "/anything"));
        key.allowed_paths = vec![AllowedPath {
            method: "post".to_string(),
            path: "/api/providers/openai/v1/chat/completions".to_string(),
        }];
        assert!(key.allows_path("POST", "/api/providers/openai/v1/chat/completions"));
        assert!(!key.allows_path("POST", "/api/providers/openai/v1/embeddings"));
    }

    #[test]
    fn test_key_camel_case_roundtrip() {
        let json = r#"{
            "keyId": "k1",
            "hashedSecret": "abc",
            "name": "n",
            "rateLimitOverTime": 1,
            "rateLimitUnit": "m",
            "settingIds": ["s1"]
        }"#;
        let key: Key = serde_json::from_str(json).unwrap();
        assert_eq!(key.rate_limit_unit, Some(WindowUnit::Minute));
        assert_eq!(key.setting_ids, vec!["s1".to_string()]);

        let value = serde_json::to_value(&key).unwrap();
        assert!(value.get("ttl").is_none());
        assert_eq!(value["keyId"], "k1");
    }

    #[test]
    fn test_setting_debug_redacts_api_key() {
        let setting = ProviderSetting {
            id: "s1".to_string(),
            provider: "openai".to_string(),
            setting: HashMap::from([(SETTING_API_KEY.to_string(), "sk-upstream".to_string())]),
            ..Default::default()
        };
        let rendered = format!("{setting:?}");
        assert!(!rendered.contains("sk-upstream"));
        assert_eq!(setting.api_key(), Some("sk-upstream"));
    }

    #[test]
    fn test_route_step_attempts_and_timeout() {
        let step = RouteStep {
            provider: "openai".to_string(),
            timeout: "2s".to_string(),
            ..Default::default()
        };
        assert_eq!(step.attempts(), 1);
        assert_eq!(step.timeout_duration().unwrap(), Duration::from_secs(2));

        let route = Route {
            id: "r1".to_string(),
            path: "/chat".to_string(),
            steps: vec![],
            ..Default::default()
        };
        assert!(route.validate().is_err());
    }
}
