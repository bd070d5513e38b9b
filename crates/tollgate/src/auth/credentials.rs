use common::consts::{
    ANTHROPIC_PROVIDER, API_KEY_HEADER, AZURE_API_KEY_HEADER, AZURE_PROVIDER,
};
use common::errors::ProxyError;
use common::models::ProviderSetting;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a client secret. Keys are stored and looked up by
/// this value only.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// The virtual key presented by the client: `x-api-key`, then `api-key`,
/// then `Authorization: Bearer`. First non-empty wins.
pub fn extract_virtual_key(headers: &HeaderMap) -> Option<&str> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header(API_KEY_HEADER)
        .or_else(|| header(AZURE_API_KEY_HEADER))
        .or_else(|| {
            header(AUTHORIZATION.as_str())
                .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
}

/// Drop every header that could carry a client credential upstream.
pub fn strip_client_credentials(headers: &mut HeaderMap) {
    headers.remove(AUTHORIZATION);
    headers.remove(API_KEY_HEADER);
    headers.remove(AZURE_API_KEY_HEADER);
}

/// Replace the client's credential with the setting's upstream key, in the
/// header the provider expects. `auth_param` names a custom provider's
/// credential header.
pub fn apply_upstream_credential(
    headers: &mut HeaderMap,
    setting: &ProviderSetting,
    auth_param: Option<&str>,
) -> Result<(), ProxyError> {
    let api_key = setting.api_key().ok_or_else(|| {
        ProxyError::Internal(format!("provider setting {} has no api key", setting.id))
    })?;
    strip_client_credentials(headers);

    let invalid = |_| ProxyError::Internal("provider api key is not a valid header value".into());
    match (setting.provider.as_str(), auth_param.filter(|p| !p.is_empty())) {
        (_, Some(param)) => {
            let name = HeaderName::from_bytes(param.as_bytes()).map_err(|_| {
                ProxyError::Internal(format!("invalid authentication param '{param}'"))
            })?;
            headers.insert(name, HeaderValue::from_str(api_key).map_err(invalid)?);
        }
        (ANTHROPIC_PROVIDER, None) => {
            headers.insert(API_KEY_HEADER, HeaderValue::from_str(api_key).map_err(invalid)?);
        }
        (AZURE_PROVIDER, None) => {
            headers.insert(
                AZURE_API_KEY_HEADER,
                HeaderValue::from_str(api_key).map_err(invalid)?,
            );
        }
        (_, None) => {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(invalid)?,
            );
        }
    }
    Ok(())
}
