use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use haven_core::crisis::{FlagSessionRequest, HandoffStatus, HumanHandoff};
use haven_core::error::ApiError;
use haven_core::sessions::Session;

use crate::crisis;
use crate::error::AppError;
use crate::identity::extract_identity;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions/{session_id}/crisis/flag", post(flag_session))
        .route(
            "/v1/sessions/{session_id}/crisis/unflag",
            post(unflag_session),
        )
        .route("/v1/handoffs", get(list_handoffs))
        .route("/v1/handoffs/{handoff_id}/acknowledge", post(acknowledge_handoff))
}

/// Manually flag a session for crisis monitoring
///
/// Explicit supervisor operation, separate from content analysis. Flagging
/// an already-flagged session updates severity and notes rather than
/// duplicating state.
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/crisis/flag",
    request_body = FlagSessionRequest,
    responses(
        (status = 200, description = "Session flagged", body = Session),
        (status = 403, description = "Requires supervisor role", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = String, Path, description = "Session id")
    ),
    tag = "crisis"
)]
pub async fn flag_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FlagSessionRequest>,
) -> Result<Json<Session>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("flag session")?;

    let session = crisis::flag_session(&state, &session_id, &identity, &req).await?;
    Ok(Json(session))
}

/// Clear a manual crisis flag
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/crisis/unflag",
    responses(
        (status = 200, description = "Session unflagged", body = Session),
        (status = 403, description = "Requires supervisor role", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = String, Path, description = "Session id")
    ),
    tag = "crisis"
)]
pub async fn unflag_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Session>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("unflag session")?;

    let session = crisis::unflag_session(&state, &session_id, &identity).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListHandoffsParams {
    /// Filter by status ("pending" or "acknowledged")
    #[serde(default)]
    pub status: Option<String>,
    /// Maximum number of handoffs to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List human handoffs for the supervisor queue
#[utoipa::path(
    get,
    path = "/v1/handoffs",
    params(ListHandoffsParams),
    responses(
        (status = 200, description = "Handoffs, newest first", body = Vec<HumanHandoff>),
        (status = 403, description = "Requires supervisor role", body = ApiError)
    ),
    tag = "crisis"
)]
pub async fn list_handoffs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListHandoffsParams>,
) -> Result<Json<Vec<HumanHandoff>>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("list handoffs")?;

    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(HandoffStatus::parse(raw).ok_or_else(|| AppError::Validation {
            message: format!("Unknown handoff status '{raw}'"),
            field: Some("status".to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: Some("Valid statuses: pending, acknowledged.".to_string()),
        })?),
    };

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let handoffs = crisis::list_handoffs(&state.db, status, limit).await?;
    Ok(Json(handoffs))
}

/// Response for handoff acknowledgement. `already_acknowledged=true` means
/// another supervisor got there first.
#[derive(Serialize, utoipa::ToSchema)]
pub struct AcknowledgeHandoffResponse {
    #[serde(flatten)]
    pub handoff: HumanHandoff,
    pub already_acknowledged: bool,
}

/// Acknowledge a human handoff
///
/// Conditional pending → acknowledged transition; idempotent under
/// concurrent acknowledgements.
#[utoipa::path(
    post,
    path = "/v1/handoffs/{handoff_id}/acknowledge",
    responses(
        (status = 200, description = "Handoff acknowledged", body = AcknowledgeHandoffResponse),
        (status = 403, description = "Requires supervisor role", body = ApiError),
        (status = 404, description = "Handoff not found", body = ApiError)
    ),
    params(
        ("handoff_id" = Uuid, Path, description = "Handoff id")
    ),
    tag = "crisis"
)]
pub async fn acknowledge_handoff(
    State(state): State<AppState>,
    Path(handoff_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<AcknowledgeHandoffResponse>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("acknowledge handoff")?;

    let (handoff, already_acknowledged) =
        crisis::acknowledge_handoff(&state.db, handoff_id, identity.user_id).await?;

    Ok(Json(AcknowledgeHandoffResponse {
        handoff,
        already_acknowledged,
    }))
}
