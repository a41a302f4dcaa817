use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use haven_core::error::{self, ApiError};
use haven_core::policy::QuotaDecision;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Quota denial (429) — expected control flow, carries the full decision
    /// so the caller knows why and when retry is possible
    QuotaExceeded { decision: QuotaDecision },
    /// Unknown session/message/handoff (404)
    NotFound { resource: String },
    /// Caller's role does not permit the operation (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Redaction or upstream-AI call failed where it must surface (502)
    ExternalService {
        service: &'static str,
        message: String,
    },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // TODO: take request_id from tower-http's request-id extension once
        // the SetRequestId layer is wired
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    detail: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::QuotaExceeded { decision } => {
                let message = decision
                    .message
                    .clone()
                    .unwrap_or_else(|| "Session quota exceeded".to_string());
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    ApiError {
                        error: error::codes::QUOTA_EXCEEDED.to_string(),
                        message,
                        field: None,
                        received: None,
                        detail: serde_json::to_value(&decision).ok(),
                        request_id,
                        docs_hint: Some(
                            "Check GET /v1/quota/check before starting a session to see \
                             current limits and wait times."
                                .to_string(),
                        ),
                    },
                )
            }
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    detail: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    detail: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::ExternalService { service, message } => {
                tracing::error!(service, "External service failure: {}", message);
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: error::codes::EXTERNAL_SERVICE_FAILURE.to_string(),
                        message: format!("The {service} service is currently unavailable"),
                        field: None,
                        received: None,
                        detail: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        detail: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        detail: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}
