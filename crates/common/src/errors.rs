use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Error as HyperError, Response, StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::consts::REQUEST_ID_HEADER;

// -----------------------------------------------------------------------------
// Proxy errors
// -----------------------------------------------------------------------------

/// Every failure a proxied request can end with. The tag decides the HTTP
/// status; the message is shown to the client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    RateLimit(String),

    #[error("{0}")]
    CostLimit(String),

    #[error("{0}")]
    Expiration(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),

    /// The upstream could not be reached at all.
    #[error("{0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) | ProxyError::Expiration(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::CostLimit(_) => StatusCode::PAYMENT_REQUIRED,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short machine-readable type.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "auth_error",
            ProxyError::Validation(_) => "validation_error",
            ProxyError::RateLimit(_) => "rate_limit_error",
            ProxyError::CostLimit(_) => "cost_limit_error",
            ProxyError::Expiration(_) => "expiration_error",
            ProxyError::NotFound(_) => "not_found_error",
            ProxyError::Internal(_) => "internal_error",
            ProxyError::Upstream(_) => "upstream_error",
        }
    }

    pub fn into_response(self, correlation_id: &str) -> Response<BoxBody<Bytes, HyperError>> {
        let body_json = json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "correlationId": correlation_id,
            }
        });

        let boxed_body = Full::new(Bytes::from(body_json.to_string()))
            .map_err(|never| match never {})
            .boxed();

        Response::builder()
            .status(self.status())
            .header("content-type", "application/json")
            .header(REQUEST_ID_HEADER, correlation_id)
            .body(boxed_body)
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::from("Internal Error"))
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }
}
