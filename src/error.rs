// ABOUTME: Error types for the image edge
// ABOUTME: Maps protocol failures to HTTP status codes and JSON bodies

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to clients by the edge service
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The compute engine did not answer within its deadline
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),

    /// An origin could not be reached at all
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::NotFound(_) => StatusCode::NOT_FOUND,
            EdgeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            EdgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EdgeError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EdgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Configuration details stay in the logs.
    pub fn message(&self) -> String {
        match self {
            EdgeError::NotFound(msg)
            | EdgeError::MethodNotAllowed(msg)
            | EdgeError::BadRequest(msg)
            | EdgeError::GatewayTimeout(msg)
            | EdgeError::Upstream(msg) => msg.clone(),
            EdgeError::Config(_) => "Service misconfigured".into(),
        }
    }

    /// JSON body in the `{"error": "..."}` shape used by every service
    pub fn to_json(&self) -> String {
        let body = ErrorBody {
            error: self.message(),
        };
        serde_json::to_string(&body).unwrap_or_else(|_| "{}".into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Invalid or missing deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, EdgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EdgeError::GatewayTimeout("slow".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            EdgeError::Upstream("down".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            EdgeError::MethodNotAllowed("POST".into()).status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_config_error_is_not_leaked() {
        let err = EdgeError::from(ConfigError::Missing("compute_host"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_json(), r#"{"error":"Service misconfigured"}"#);
    }
}
