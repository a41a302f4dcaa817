use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use haven_core::error::ApiError;
use haven_core::realtime::{RealtimeEvent, events};
use haven_core::sessions::{
    EndSessionResponse, EndedBy, Session, SessionStatus, StartSessionRequest,
    StartSessionResponse,
};

use crate::error::AppError;
use crate::identity::{Identity, extract_identity};
use crate::registry;
use crate::state::AppState;

pub fn write_router() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions", post(start_session))
        .route("/v1/sessions/{session_id}/end", post(end_session))
}

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{session_id}", get(get_session))
}

/// Owner, staff, or anyone holding the id of an anonymous session.
pub fn authorize_session_access(
    identity: &Identity,
    session: &Session,
) -> Result<(), AppError> {
    let is_owner = match session.user_id {
        // Anonymous sessions: possession of the opaque id is the capability
        None => true,
        Some(owner) => identity.user_id == Some(owner),
    };

    if is_owner || identity.is_supervisor() {
        return Ok(());
    }

    Err(AppError::Forbidden {
        message: "This session belongs to another user".to_string(),
        docs_hint: None,
    })
}

/// Start a session
///
/// Gated by the quota policy. Idempotent per user: if the caller already has
/// an active session it is returned with `existing=true` instead of creating
/// a second one. A denial explains why and when retry is possible.
#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created", body = StartSessionResponse),
        (status = 200, description = "Existing active session returned", body = StartSessionResponse),
        (status = 429, description = "Quota exceeded", body = ApiError)
    ),
    params(
        ("x-user-id" = Option<String>, Header, description = "Caller user id (UUID); omit for anonymous"),
        ("x-user-role" = Option<String>, Header, description = "member (default), supervisor, or admin")
    ),
    tag = "sessions"
)]
pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = extract_identity(&headers)?;

    let decision = state.quota.check_allowed(&state.db, &identity).await?;
    if !decision.allowed {
        return Err(AppError::QuotaExceeded { decision });
    }
    let limits = decision.limits;
    let duration_minutes = limits
        .as_ref()
        .map(|l| l.max_duration_minutes)
        .unwrap_or(haven_core::policy::DEFAULT_MAX_DURATION_MINUTES);

    let (session, configuration, existing) =
        registry::start_session(&state.db, identity.user_id, &req, duration_minutes).await?;

    if !existing {
        state.scheduler.arm(
            state.db.clone(),
            state.bus.clone(),
            session.id.clone(),
            configuration.max_duration_minutes,
        );
        state.bus.publish_broadcast(RealtimeEvent::new(
            events::SESSION_CREATED,
            Some(&session.id),
            json!({ "session": session }),
        ));
        tracing::info!(session_id = %session.id, "session started");
    }

    let status = if existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(StartSessionResponse {
            session,
            configuration,
            existing,
            limits,
        }),
    ))
}

/// End a session
///
/// Idempotent: ending an already-ended session returns it unchanged with
/// `already_ended=true` and re-fires no side effects. Cancels the pending
/// auto-termination timer.
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/end",
    responses(
        (status = 200, description = "Session ended (or was already ended)", body = EndSessionResponse),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = String, Path, description = "Session id")
    ),
    tag = "sessions"
)]
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EndSessionResponse>, AppError> {
    let identity = extract_identity(&headers)?;
    let session = registry::get_session(&state.db, &session_id).await?;
    authorize_session_access(&identity, &session)?;

    let acting_as_staff = identity.is_supervisor()
        && session.user_id.is_some()
        && session.user_id != identity.user_id;
    let ended_by = if acting_as_staff {
        EndedBy::Admin
    } else {
        EndedBy::User
    };

    let (session, already_ended) = registry::end_session(
        &state.db,
        &state.bus,
        &state.scheduler,
        &session_id,
        ended_by,
        false,
        None,
    )
    .await?;

    Ok(Json(EndSessionResponse {
        session,
        already_ended,
    }))
}

/// Fetch one session
#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, description = "Session", body = Session),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = String, Path, description = "Session id")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Session>, AppError> {
    let identity = extract_identity(&headers)?;
    let session = registry::get_session(&state.db, &session_id).await?;
    authorize_session_access(&identity, &session)?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListSessionsParams {
    /// Filter by status ("active" or "ended")
    #[serde(default)]
    pub status: Option<String>,
    /// Maximum number of sessions to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List sessions for the supervisor dashboard
#[utoipa::path(
    get,
    path = "/v1/sessions",
    params(ListSessionsParams),
    responses(
        (status = 200, description = "Sessions, newest first", body = Vec<Session>),
        (status = 403, description = "Requires supervisor role", body = ApiError)
    ),
    tag = "sessions"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<Vec<Session>>, AppError> {
    let identity = extract_identity(&headers)?;
    identity.require_supervisor("list sessions")?;

    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(SessionStatus::parse(raw).ok_or_else(|| AppError::Validation {
            message: format!("Unknown session status '{raw}'"),
            field: Some("status".to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: Some("Valid statuses: active, ended.".to_string()),
        })?),
    };

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let sessions = registry::list_sessions(&state.db, status, limit).await?;
    Ok(Json(sessions))
}
