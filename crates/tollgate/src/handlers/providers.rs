//! Upstream URLs and usage shapes for the built-in providers.

use common::configuration::UpstreamConfig;
use common::consts::{ANTHROPIC_PROVIDER, AZURE_PROVIDER, OPENAI_PROVIDER};
use common::errors::ProxyError;
use common::models::{ProviderSetting, SETTING_API_VERSION, SETTING_RESOURCE_NAME};

use super::request::query_param;
use crate::events::UsageKind;

/// How the consumer should read usage for a provider-relative path.
pub fn usage_for(provider: &str, upstream_path: &str) -> Result<UsageKind, ProxyError> {
    let usage = match (provider, upstream_path) {
        (OPENAI_PROVIDER, "/v1/chat/completions") => Some(UsageKind::OpenAiChat),
        (OPENAI_PROVIDER, "/v1/embeddings") => Some(UsageKind::OpenAiEmbeddings),
        (OPENAI_PROVIDER, "/v1/audio/speech") => Some(UsageKind::OpenAiSpeech),
        (ANTHROPIC_PROVIDER, "/v1/complete") => Some(UsageKind::AnthropicComplete),
        (AZURE_PROVIDER, path) => match azure_operation(path) {
            Some((_, "chat/completions")) => Some(UsageKind::AzureChat),
            Some((_, "embeddings")) => Some(UsageKind::AzureEmbeddings),
            _ => None,
        },
        _ => None,
    };
    usage.ok_or_else(|| ProxyError::NotFound(format!("{provider} does not serve {upstream_path}")))
}

/// `/deployments/<id>/<op>` split into deployment id and operation.
fn azure_operation(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/deployments/")?;
    let (deployment, op) = rest.split_once('/')?;
    (!deployment.is_empty()).then_some((deployment, op))
}

/// The upstream URL for a built-in provider request.
pub fn upstream_url(
    upstream: &UpstreamConfig,
    provider: &str,
    upstream_path: &str,
    query: Option<&str>,
    setting: &ProviderSetting,
) -> Result<String, ProxyError> {
    let with_query = |base: &str| match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{}{upstream_path}?{q}", base.trim_end_matches('/')),
        None => format!("{}{upstream_path}", base.trim_end_matches('/')),
    };

    match provider {
        OPENAI_PROVIDER => Ok(with_query(&upstream.openai_base_url)),
        ANTHROPIC_PROVIDER => Ok(with_query(&upstream.anthropic_base_url)),
        AZURE_PROVIDER => {
            let api_version = query_param(query, "api-version")
                .filter(|v| !v.is_empty())
                .or_else(|| setting.param(SETTING_API_VERSION))
                .ok_or_else(|| ProxyError::Validation("api-version is required".into()))?;
            let base = azure_base(upstream, setting)?;
            Ok(format!("{base}/openai{upstream_path}?api-version={api_version}"))
        }
        other => Err(ProxyError::NotFound(format!("unknown provider {other}"))),
    }
}

/// Azure deployment URL used by route steps: `<base>/openai/deployments/<id>/<op>`.
pub fn azure_deployment_url(
    upstream: &UpstreamConfig,
    setting: &ProviderSetting,
    deployment: &str,
    operation: &str,
) -> Result<String, ProxyError> {
    let api_version = setting.param(SETTING_API_VERSION).ok_or_else(|| {
        ProxyError::Internal(format!("azure setting {} has no apiVersion", setting.id))
    })?;
    let base = azure_base(upstream, setting)?;
    Ok(format!(
        "{base}/openai/deployments/{deployment}/{operation}?api-version={api_version}"
    ))
}

fn azure_base(upstream: &UpstreamConfig, setting: &ProviderSetting) -> Result<String, ProxyError> {
    match (&upstream.azure_base_url, setting.param(SETTING_RESOURCE_NAME)) {
        (Some(_), resource) => Ok(upstream.azure_base(resource.unwrap_or_default())),
        (None, Some(resource)) => Ok(upstream.azure_base(resource)),
        (None, None) => Err(ProxyError::Internal(format!(
            "azure setting {} has no resourceName",
            setting.id
        ))),
    }
}
