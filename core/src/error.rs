use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response — designed for clients to act on, not just read.
/// Quota and conflict conditions are expected control flow and carry enough
/// detail (limit, current count, minutes remaining) for the caller to retry
/// at the right time.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "quota_exceeded", "not_found")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Structured detail for quota denials: reason, limits, wait time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const FORBIDDEN: &str = "forbidden";
    pub const EXTERNAL_SERVICE_FAILURE: &str = "external_service_failure";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const RATE_LIMITED: &str = "rate_limited";
}
