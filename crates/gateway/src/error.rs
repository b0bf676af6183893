use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use freemonitor_common::payload::PayloadError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::RateLimited => "request was rate limited",
            Self::InternalError => "internal server error",
        }
    }
}

/// Every way a gateway operation can be refused.
///
/// Over WebSocket these surface as the `reason` of a rejected ack; on the
/// HTTP surface they render through [`IntoResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("not authorized for device {device_id}")]
    Authorization { device_id: String },
    #[error("alert {alert_id} does not belong to device {device_id}")]
    AlertAuthorization { alert_id: String, device_id: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn unauthorized(device_id: impl Into<String>) -> Self {
        Self::Authorization { device_id: device_id.into() }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Authorization { .. } | Self::AlertAuthorization { .. } | Self::Forbidden(_) => {
                ErrorCode::AuthForbidden
            }
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::InvalidIdentity(_) => ErrorCode::AuthInvalidToken,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<PayloadError> for GatewayError {
    fn from(error: PayloadError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.code();
        (
            code.status(),
            Json(json!({
                "error": {
                    "code": code.as_str(),
                    "message": self.to_string(),
                    "retryable": code.retryable(),
                }
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
