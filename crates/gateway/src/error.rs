use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::auth::AuthFailure;

/// Failures surfaced by the transports.
///
/// Request-level variants map onto HTTP statuses; transport-level variants
/// are logged and reflected in `Service::good()`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unsupported content type: {0}")]
    NotAcceptable(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,
}

impl From<AuthFailure> for GatewayError {
    fn from(failure: AuthFailure) -> Self {
        Self::Unauthorized(failure)
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(AuthFailure::TokenMissing) => StatusCode::UNAUTHORIZED,
            Self::Unauthorized(AuthFailure::TokenMismatch) => StatusCode::FORBIDDEN,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Bind { .. } | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.status_code().into_response()
    }
}
