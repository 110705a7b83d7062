use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use loft_core::OrchError;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<OrchError> for ApiError {
    fn from(e: OrchError) -> Self {
        let status = match &e {
            OrchError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchError::Forbidden => StatusCode::FORBIDDEN,
            OrchError::InvalidState { .. } | OrchError::Conflict => StatusCode::CONFLICT,
            OrchError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            OrchError::InsufficientResources(_) | OrchError::NoFreePorts => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchError::DriverFailed(_) | OrchError::IaasToolFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            OrchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError { status, code: e.code(), message: e.to_string() }
    }
}
