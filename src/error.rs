//! Error types for the gateway.
//!
//! Every failure the request pipeline can hit is a [`GatewayError`]. The
//! handler turns it into an HTTP response through [`IntoResponse`], so each
//! variant owns its status code and its error `type` string.

use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The inbound body could not be buffered: over the size limit, or the
    /// caller's connection broke mid-upload.
    #[error("request body rejected: {message}")]
    RequestBody { status: u16, message: String },

    #[error("no route for model: {model}")]
    ModelNotFound { model: String },

    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: String },

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("decode error: {message}")]
    Translation { message: String },

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A non-success status reported by the upstream itself.
    #[error("{kind}: {message}")]
    Upstream {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("read upstream response: {message}")]
    UpstreamRead { message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn upstream_read(msg: impl Into<String>) -> Self {
        Self::UpstreamRead {
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RequestBody { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::RetriesExhausted { .. } | Self::UpstreamRead { .. } | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            // nginx's "client closed request"; the caller is usually gone already
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Config { .. }
            | Self::ProviderNotFound { .. }
            | Self::Encode { .. }
            | Self::Translation { .. }
            | Self::Toml(_)
            | Self::Yaml(_)
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            Self::Config { .. } | Self::Toml(_) | Self::Yaml(_) => "configuration_error",
            Self::InvalidRequest { .. } | Self::RequestBody { .. } => "invalid_request_error",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::ProviderNotFound { .. } => "provider_not_found",
            Self::Encode { .. } => "encode_error",
            Self::Translation { .. } => "translation_error",
            Self::RetriesExhausted { .. } => "max_retries_exceeded",
            Self::Upstream { kind, .. } => kind,
            Self::UpstreamRead { .. } | Self::Http(_) => "upstream_error",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Message shown to the caller. Upstream errors are relayed as decoded,
    /// everything else uses the display form.
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream { kind, message, .. } if kind.is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.client_message();

        if status.is_server_error() {
            tracing::error!(
                error_type = self.error_type(),
                status = status.as_u16(),
                message = %message,
                "Request failed"
            );
        } else {
            tracing::warn!(
                error_type = self.error_type(),
                status = status.as_u16(),
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": message,
                "code": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<BytesRejection> for GatewayError {
    fn from(rejection: BytesRejection) -> Self {
        Self::RequestBody {
            status: rejection.status().as_u16(),
            message: rejection.body_text(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(
            GatewayError::invalid_request("bad json").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ModelNotFound {
                model: "llama-70b".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_upstream_status_is_propagated() {
        let err = GatewayError::Upstream {
            status: 429,
            kind: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_type(), "rate_limit_exceeded");
        assert_eq!(err.client_message(), "rate_limit_exceeded: slow down");
    }

    #[test]
    fn test_exhausted_is_bad_gateway() {
        let err = GatewayError::RetriesExhausted {
            attempts: 3,
            last_error: "upstream error: 503".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "max retries exceeded after 3 attempts: upstream error: 503"
        );
    }

    #[test]
    fn test_dangling_route_is_server_error() {
        let err = GatewayError::ProviderNotFound {
            provider: "ghost".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "provider not found: ghost");
    }

    #[test]
    fn test_oversized_body_keeps_its_status() {
        let err = GatewayError::RequestBody {
            status: 413,
            message: "length limit exceeded".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.error_type(), "invalid_request_error");
        assert_eq!(err.to_string(), "request body rejected: length limit exceeded");
    }
}
