use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::FlowError;
use crate::gateway::GatewayError;
use crate::storage::StoreError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Application error type that converts to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    ServiceUnavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
            AppError::Internal(err) => {
                error!(error = %format!("{:#}", err), "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(format!("{:#}", err)),
                )
            }
        };

        (status, Json(ErrorResponse { error, details })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        let msg = err.to_string();
        match err {
            FlowError::Resolve(_) | FlowError::Bind(_) | FlowError::MalformedParameters(_) => {
                AppError::BadRequest(msg)
            }
            FlowError::NotFound(_) => AppError::NotFound(msg),
            FlowError::Store(StoreError::DuplicateKey(_) | StoreError::DuplicateExecutionId(_)) => {
                AppError::Conflict(msg)
            }
            FlowError::Store(e) => AppError::Internal(e.into()),
            FlowError::Gateway(GatewayError::Connection(_)) => AppError::ServiceUnavailable(msg),
            FlowError::Gateway(GatewayError::Rejected(_) | GatewayError::Protocol(_)) => {
                AppError::BadGateway(msg)
            }
        }
    }
}
