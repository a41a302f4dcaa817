use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use haven_core::error::ApiError;
use haven_core::policy::{QuotaDecision, QuotaPolicy};

use crate::error::AppError;
use crate::identity::extract_identity;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/quota/check", get(check_quota))
        .route("/v1/quota/policy", get(get_policy))
}

/// Preview the quota gate for the caller
///
/// Read-only and safe to call repeatedly; this is the same check that runs
/// on session start. A denial carries the reason and wait-time detail.
#[utoipa::path(
    get,
    path = "/v1/quota/check",
    responses(
        (status = 200, description = "Quota decision", body = QuotaDecision)
    ),
    params(
        ("x-user-id" = Option<String>, Header, description = "Caller user id (UUID); omit for anonymous"),
        ("x-user-role" = Option<String>, Header, description = "member (default), supervisor, or admin")
    ),
    tag = "quota"
)]
pub async fn check_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QuotaDecision>, AppError> {
    let identity = extract_identity(&headers)?;
    let decision = state.quota.check_allowed(&state.db, &identity).await?;
    Ok(Json(decision))
}

/// Response for GET /v1/quota/policy
#[derive(Serialize, utoipa::ToSchema)]
pub struct EffectivePolicyResponse {
    #[serde(flatten)]
    pub policy: QuotaPolicy,
    /// "store" when loaded from persistence, "defaults" on fallback
    pub source: String,
}

/// Current effective quota policy
///
/// Cached with a short TTL; edits to the stored policy take effect without a
/// restart.
#[utoipa::path(
    get,
    path = "/v1/quota/policy",
    responses(
        (status = 200, description = "Effective policy", body = EffectivePolicyResponse),
        (status = 403, description = "Requires supervisor role", body = ApiError)
    ),
    tag = "quota"
)]
pub async fn get_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EffectivePolicyResponse>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("read quota policy")?;

    let (policy, from_store) = state.quota.policy(&state.db).await;
    Ok(Json(EffectivePolicyResponse {
        policy,
        source: if from_store { "store" } else { "defaults" }.to_string(),
    }))
}
