//! Error types for the proxy
//!
//! Startup problems surface as [`ConfigError`], background discovery problems as
//! [`DiscoveryError`] (logged, never returned to callers), and everything a caller can see
//! as [`ProxyError`], which renders an OpenAI-compatible error body.
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning configuration into running components. These are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("static instance #{index} has no endpoint")]
    MissingEndpoint { index: usize },

    #[error("static instance #{index} has an invalid endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        index: usize,
        endpoint: String,
        source: url::ParseError,
    },

    #[error("static instance #{index} ({endpoint}) serves no models")]
    NoModels { index: usize, endpoint: String },

    #[error("auth_key must be a base64-url encoded 32-byte key: {0}")]
    InvalidAuthKey(String),

    #[error("kubernetes client configuration: {0}")]
    Kubernetes(String),
}

/// Transient failures of the discovery layer. A pass or a single pod is skipped, nothing more.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("orchestration API request failed: {0}")]
    Api(String),

    #[error("orchestration API returned {status}: {body}")]
    ApiStatus { status: StatusCode, body: String },

    #[error("model probe against {url} failed: {reason}")]
    Probe { url: String, reason: String },

    #[error("model probe against {url} timed out")]
    ProbeTimeout { url: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("annotation {key}='{value}' is invalid: {reason}")]
    InvalidAnnotation {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failures verifying a caller-supplied token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing API key")]
    Missing,

    #[error("invalid API key")]
    Invalid,
}

/// Errors surfaced to the caller of the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),

    #[error("{0}")]
    BadRequest(String),

    #[error("unknown model: '{0}'")]
    ModelNotFound(String),

    #[error("all {attempts} backend(s) for model '{model}' failed, last error: {last}")]
    UpstreamExhausted {
        model: String,
        attempts: usize,
        last: String,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamExhausted { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Unauthorized(_) => "authentication_error",
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::UpstreamExhausted { .. } => "upstream_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_error_renders_openai_shape() {
        let response = ProxyError::ModelNotFound("gpt-5".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["type"], "model_not_found");
        assert_eq!(body["error"]["message"], "unknown model: 'gpt-5'");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::from(AuthError::Invalid).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::UpstreamExhausted {
                model: "m".into(),
                attempts: 2,
                last: "timeout".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BadRequest("no model".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
