use std::path::Path;
use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_STREAM_CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    Dev,
    #[default]
    Production,
    Strict,
}

impl LogMode {
    pub fn default_filter(&self) -> &'static str {
        match self {
            LogMode::Dev => "debug",
            LogMode::Production | LogMode::Strict => "info",
        }
    }

    /// Request and response bodies may be written to logs.
    pub fn logs_bodies(&self) -> bool {
        !matches!(self, LogMode::Strict)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
    #[serde(default = "default_bus_workers")]
    pub workers: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            workers: default_bus_workers(),
        }
    }
}

/// Base URLs of the built-in providers. Overridable so tests and on-prem
/// gateways can point elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    /// When unset the Azure URL is derived from the setting's `resourceName`.
    pub azure_base_url: Option<String>,
    #[serde(default = "default_upstream_timeout")]
    pub timeout: DurationString,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            openai_base_url: default_openai_base_url(),
            anthropic_base_url: default_anthropic_base_url(),
            azure_base_url: None,
            timeout: default_upstream_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn azure_base(&self, resource_name: &str) -> String {
        match &self.azure_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{resource_name}.openai.azure.com"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Postgres DSN for keys, settings, routes, custom providers and events.
    pub database_url: Option<String>,
    /// Redis DSN for counters and access markers.
    pub redis_url: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: DurationString,
    #[serde(default)]
    pub log_mode: LogMode,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default = "default_stream_capture_limit")]
    pub stream_capture_limit_bytes: usize,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: DurationString,
    pub metrics_port: Option<u16>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            proxy_port: default_proxy_port(),
            bind_address: default_bind_address(),
            database_url: None,
            redis_url: None,
            refresh_interval: default_refresh_interval(),
            log_mode: LogMode::default(),
            event_bus: EventBusConfig::default(),
            upstream: UpstreamConfig::default(),
            stream_capture_limit_bytes: default_stream_capture_limit(),
            shutdown_timeout: default_shutdown_timeout(),
            metrics_port: None,
        }
    }
}

impl Configuration {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_port == self.proxy_port {
            return Err(ConfigError::Invalid(
                "admin_port and proxy_port must differ".to_string(),
            ));
        }
        if self.event_bus.capacity == 0 || self.event_bus.workers == 0 {
            return Err(ConfigError::Invalid(
                "event_bus capacity and workers must be positive".to_string(),
            ));
        }
        if self.refresh_interval().is_zero() {
            return Err(ConfigError::Invalid("refresh_interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval.clone().into()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout.clone().into()
    }

    pub fn upstream_timeout(&self) -> Duration {
        self.upstream.timeout.clone().into()
    }
}

fn default_admin_port() -> u16 {
    8001
}

fn default_proxy_port() -> u16 {
    8002
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_refresh_interval() -> DurationString {
    DurationString::new(Duration::from_secs(5))
}

fn default_shutdown_timeout() -> DurationString {
    DurationString::new(Duration::from_secs(5))
}

fn default_upstream_timeout() -> DurationString {
    DurationString::new(Duration::from_secs(180))
}

fn default_stream_capture_limit() -> usize {
    DEFAULT_STREAM_CAPTURE_LIMIT
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_bus_workers() -> usize {
    4
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = Configuration::from_yaml("log_mode: strict\n").unwrap();
        assert_eq!(config.admin_port, 8001);
        assert_eq!(config.proxy_port, 8002);
        assert_eq!(config.log_mode, LogMode::Strict);
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.stream_capture_limit_bytes, 4 * 1024 * 1024);
        assert_eq!(config.event_bus.workers, 4);
        assert!(config.database_url.is_none());
        assert!(!config.log_mode.logs_bodies());
    }

    #[test]
    fn test_log_modes_differ() {
        let modes = [LogMode::Dev, LogMode::Production, LogMode::Strict];
        let filters: Vec<_> = modes.iter().map(LogMode::default_filter).collect();
        let bodies: Vec<_> = modes.iter().map(LogMode::logs_bodies).collect();
        assert_eq!(filters, vec!["debug", "info", "info"]);
        assert_eq!(bodies, vec![true, true, false]);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
admin_port: 9001
proxy_port: 9002
database_url: postgres://localhost/tollgate
redis_url: redis://localhost:6379
refresh_interval: 2s
log_mode: dev
event_bus:
  capacity: 16
  workers: 2
upstream:
  openai_base_url: http://localhost:1234
  azure_base_url: http://localhost:1235/
  timeout: 30s
"#;
        let config = Configuration::from_yaml(yaml).unwrap();
        assert_eq!(config.proxy_port, 9002);
        assert_eq!(config.refresh_interval(), Duration::from_secs(2));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.anthropic_base_url, "https://api.anthropic.com");
        assert_eq!(config.upstream.azure_base("ignored"), "http://localhost:1235");
        assert_eq!(config.event_bus.capacity, 16);
        assert_eq!(config.log_mode.default_filter(), "debug");
    }

    #[test]
    fn test_azure_base_from_resource() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.azure_base("acme"),
            "https://acme.openai.azure.com"
        );
    }

    #[test]
    fn test_validate_rejects_shared_port() {
        let config = Configuration::from_yaml("admin_port: 9000\nproxy_port: 9000\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Configuration::load("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_rejects_unknown_log_mode() {
        assert!(Configuration::from_yaml("log_mode: chatty\n").is_err());
    }
}
