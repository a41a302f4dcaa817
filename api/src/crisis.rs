use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use haven_core::crisis::{
    CrisisSeverity, FlagSessionRequest, HIGH_TIER_GUIDANCE, HandoffStatus, HumanHandoff,
    MAX_RISK_SCORE, MEDIUM_TIER_GUIDANCE, RiskAssessment, assess_transcript, check_in_message,
    emergency_message, emergency_resources, self_help_message,
};
use haven_core::messages::{Message, MessageRole};
use haven_core::realtime::{RealtimeEvent, events};
use haven_core::sessions::Session;

use crate::error::AppError;
use crate::identity::Identity;
use crate::registry;
use crate::routes::messages::{NewMessage, insert_messages_internal, publish_new_messages};
use crate::state::AppState;

/// How many recent user messages the classifier sees per evaluation.
const TRANSCRIPT_WINDOW_MESSAGES: i64 = 10;

/// Run one classifier evaluation over the session's recent transcript and
/// drive the graduated intervention protocol for whatever tier comes out.
/// Severity is derived fresh each time — there is no stored severity state
/// machine to transition.
pub async fn evaluate_session(
    state: &AppState,
    session_id: &str,
    language: &str,
    trigger_message_id: Option<Uuid>,
) -> Result<Option<RiskAssessment>, AppError> {
    let window: Vec<String> = sqlx::query_scalar(
        "SELECT content FROM ( \
            SELECT content, created_at, id FROM messages \
            WHERE session_id = $1 AND role = 'user' \
            ORDER BY created_at DESC, id DESC LIMIT $2 \
         ) recent ORDER BY created_at ASC, id ASC",
    )
    .bind(session_id)
    .bind(TRANSCRIPT_WINDOW_MESSAGES)
    .fetch_all(&state.db)
    .await?;

    let Some(assessment) = assess_transcript(&window) else {
        return Ok(None);
    };

    tracing::info!(
        session_id,
        severity = assessment.severity.as_str(),
        risk_score = assessment.risk_score,
        "crisis signal detected"
    );

    // The audit trail must never be lost: record the detection before any
    // real-time publish. Publish failure is non-fatal to these writes.
    record_crisis_event(&state.db, session_id, assessment, trigger_message_id).await?;

    match assessment.severity {
        CrisisSeverity::Low => low_tier(state, session_id, language, assessment).await?,
        CrisisSeverity::Medium => medium_tier(state, session_id, language, assessment).await?,
        CrisisSeverity::High => high_tier(state, session_id, language, assessment).await?,
    }

    state.bus.publish_broadcast(RealtimeEvent::new(
        events::CRISIS_DETECTED,
        Some(session_id),
        json!({
            "severity": assessment.severity.as_str(),
            "risk_score": assessment.risk_score,
        }),
    ));

    Ok(Some(assessment))
}

/// Low: a self-help/coping message into the session. No escalation.
async fn low_tier(
    state: &AppState,
    session_id: &str,
    language: &str,
    assessment: RiskAssessment,
) -> Result<(), AppError> {
    let text = self_help_message(language);
    record_intervention(
        &state.db,
        session_id,
        assessment.severity,
        "self_help_prompt",
        json!({ "risk_score": assessment.risk_score, "message": text }),
    )
    .await?;

    let stored = store_engine_messages(
        state,
        session_id,
        vec![visible_intervention(session_id, text)],
    )
    .await?;
    publish_new_messages(&state.bus, session_id, &stored);

    Ok(())
}

/// Medium: validating check-in to the user, hidden behavioral guidance to
/// the AI channel, supervisor review requested, monitoring raised to high.
async fn medium_tier(
    state: &AppState,
    session_id: &str,
    language: &str,
    assessment: RiskAssessment,
) -> Result<(), AppError> {
    let text = check_in_message(language);
    record_intervention(
        &state.db,
        session_id,
        assessment.severity,
        "supervisor_review",
        json!({ "risk_score": assessment.risk_score, "message": text }),
    )
    .await?;

    let stored = store_engine_messages(
        state,
        session_id,
        vec![
            visible_intervention(session_id, text),
            hidden_guidance(session_id, MEDIUM_TIER_GUIDANCE),
        ],
    )
    .await?;

    raise_monitoring(&state.db, session_id, "high", &["normal"]).await?;

    publish_new_messages(&state.bus, session_id, &stored);
    state.bus.publish_broadcast(RealtimeEvent::new(
        events::SUPERVISOR_REVIEW_REQUIRED,
        Some(session_id),
        json!({
            "severity": assessment.severity.as_str(),
            "risk_score": assessment.risk_score,
        }),
    ));

    forward_hidden_to_provider(state, session_id, MEDIUM_TIER_GUIDANCE).await;

    Ok(())
}

/// High: emergency resources to the user, a crisis-emergency event on both
/// topics, hidden de-escalation guidance, human handoff, monitoring
/// critical, session crisis fields set.
async fn high_tier(
    state: &AppState,
    session_id: &str,
    language: &str,
    assessment: RiskAssessment,
) -> Result<(), AppError> {
    let text = emergency_message(language);
    let resources = emergency_resources();

    record_intervention(
        &state.db,
        session_id,
        assessment.severity,
        "emergency_alert",
        json!({
            "risk_score": assessment.risk_score,
            "message": text,
            "resources": resources,
        }),
    )
    .await?;

    sqlx::query(
        "UPDATE sessions SET crisis_flagged = TRUE, crisis_severity = 'high', \
                crisis_risk_score = $2, monitoring_frequency = 'critical' \
         WHERE id = $1",
    )
    .bind(session_id)
    .bind(assessment.risk_score)
    .execute(&state.db)
    .await?;

    let handoff = create_handoff(
        &state.db,
        session_id,
        assessment.risk_score,
        "High-severity crisis signal detected in transcript",
    )
    .await?;

    let stored = store_engine_messages(
        state,
        session_id,
        vec![
            visible_intervention(session_id, text),
            hidden_guidance(session_id, HIGH_TIER_GUIDANCE),
        ],
    )
    .await?;

    publish_new_messages(&state.bus, session_id, &stored);

    let emergency = RealtimeEvent::new(
        events::CRISIS_EMERGENCY,
        Some(session_id),
        json!({
            "severity": assessment.severity.as_str(),
            "risk_score": assessment.risk_score,
            "resources": resources,
            "handoff_id": handoff.id,
        }),
    );
    state.bus.publish_session(session_id, emergency.clone());
    state.bus.publish_broadcast(emergency);

    forward_hidden_to_provider(state, session_id, HIGH_TIER_GUIDANCE).await;

    tracing::warn!(
        session_id,
        risk_score = assessment.risk_score,
        handoff_id = %handoff.id,
        "high-tier crisis response fired; human handoff initiated"
    );

    Ok(())
}

fn visible_intervention(session_id: &str, text: &str) -> NewMessage {
    NewMessage {
        role: MessageRole::Assistant,
        message_type: "crisis_intervention".to_string(),
        content: text.to_string(),
        // Engine-authored text carries no user identifiers; it is its own
        // privacy-safe variant
        redacted_content: Some(text.to_string()),
        metadata: json!({ "source": "crisis_engine", "session_id": session_id }),
    }
}

fn hidden_guidance(session_id: &str, text: &str) -> NewMessage {
    NewMessage {
        role: MessageRole::System,
        message_type: "ai_guidance".to_string(),
        content: text.to_string(),
        redacted_content: Some(text.to_string()),
        metadata: json!({
            "source": "crisis_engine",
            "session_id": session_id,
            "hidden_from_user": true,
        }),
    }
}

async fn store_engine_messages(
    state: &AppState,
    session_id: &str,
    batch: Vec<NewMessage>,
) -> Result<Vec<Message>, AppError> {
    insert_messages_internal(&state.db, session_id, batch).await
}

/// Forward hidden guidance into the upstream-AI channel. Failure here is
/// logged and swallowed — the guidance is already persisted and the audit
/// record already written.
async fn forward_hidden_to_provider(state: &AppState, session_id: &str, text: &str) {
    if let Err(err) = state
        .provider
        .inject_turn(session_id, MessageRole::System, text, true)
        .await
    {
        tracing::warn!(session_id, error = %err, "failed to forward guidance to provider");
    }
}

/// Raise monitoring_frequency, never lower it. `from` lists the states the
/// transition may leave.
async fn raise_monitoring(
    db: &PgPool,
    session_id: &str,
    to: &str,
    from: &[&str],
) -> Result<(), AppError> {
    let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
    sqlx::query(
        "UPDATE sessions SET monitoring_frequency = $2 \
         WHERE id = $1 AND monitoring_frequency = ANY($3)",
    )
    .bind(session_id)
    .bind(to)
    .bind(&from)
    .execute(db)
    .await?;
    Ok(())
}

async fn record_crisis_event(
    db: &PgPool,
    session_id: &str,
    assessment: RiskAssessment,
    trigger_message_id: Option<Uuid>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO crisis_events (id, session_id, severity, risk_score, trigger_message_id) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::now_v7())
    .bind(session_id)
    .bind(assessment.severity.as_str())
    .bind(assessment.risk_score)
    .bind(trigger_message_id)
    .execute(db)
    .await?;
    Ok(())
}

async fn record_intervention(
    db: &PgPool,
    session_id: &str,
    tier: CrisisSeverity,
    action: &str,
    payload: serde_json::Value,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO intervention_actions (id, session_id, tier, action, payload) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::now_v7())
    .bind(session_id)
    .bind(tier.as_str())
    .bind(action)
    .bind(payload)
    .execute(db)
    .await?;
    Ok(())
}

// --- Manual supervisor flagging (explicit, not content-derived) ---

/// Flag a session for crisis monitoring. Idempotent-safe: flagging an
/// already-flagged session updates severity/score/notes rather than
/// duplicating state.
pub async fn flag_session(
    state: &AppState,
    session_id: &str,
    supervisor: &Identity,
    req: &FlagSessionRequest,
) -> Result<Session, AppError> {
    let risk_score = req.risk_score.map(|s| s.clamp(0, MAX_RISK_SCORE));

    let row = sqlx::query_as::<_, registry::SessionRow>(
        "UPDATE sessions SET crisis_flagged = TRUE, crisis_severity = $2, \
                crisis_risk_score = COALESCE($3, crisis_risk_score) \
         WHERE id = $1 \
         RETURNING id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                   crisis_severity, crisis_risk_score, monitoring_frequency",
    )
    .bind(session_id)
    .bind(req.severity.as_str())
    .bind(risk_score)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("session {session_id}"),
    })?;

    record_intervention(
        &state.db,
        session_id,
        req.severity,
        "manual_flag",
        json!({
            "supervisor_id": supervisor.user_id,
            "notes": req.notes,
        }),
    )
    .await?;

    let event = RealtimeEvent::new(
        events::CRISIS_FLAGGED,
        Some(session_id),
        json!({
            "severity": req.severity.as_str(),
            "risk_score": risk_score,
        }),
    );
    state.bus.publish_session(session_id, event.clone());
    state.bus.publish_broadcast(event);

    Ok(row.into_session())
}

/// Clear a manual flag. Idempotent — unflagging an unflagged session is a
/// no-op that still reports current state.
pub async fn unflag_session(
    state: &AppState,
    session_id: &str,
    supervisor: &Identity,
) -> Result<Session, AppError> {
    let row = sqlx::query_as::<_, registry::SessionRow>(
        "UPDATE sessions SET crisis_flagged = FALSE, crisis_severity = NULL, \
                crisis_risk_score = NULL, monitoring_frequency = 'normal' \
         WHERE id = $1 \
         RETURNING id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                   crisis_severity, crisis_risk_score, monitoring_frequency",
    )
    .bind(session_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("session {session_id}"),
    })?;

    record_intervention(
        &state.db,
        session_id,
        CrisisSeverity::Low,
        "manual_unflag",
        json!({ "supervisor_id": supervisor.user_id }),
    )
    .await?;

    let event = RealtimeEvent::new(events::CRISIS_UNFLAGGED, Some(session_id), json!({}));
    state.bus.publish_session(session_id, event.clone());
    state.bus.publish_broadcast(event);

    Ok(row.into_session())
}

// --- Human handoff ---

pub async fn create_handoff(
    db: &PgPool,
    session_id: &str,
    risk_score: i32,
    reason: &str,
) -> Result<HumanHandoff, AppError> {
    let row = sqlx::query_as::<_, HandoffRow>(
        "INSERT INTO human_handoffs (id, session_id, status, risk_score, reason) \
         VALUES ($1, $2, 'pending', $3, $4) \
         RETURNING id, session_id, status, risk_score, reason, created_at, \
                   acknowledged_at, acknowledged_by",
    )
    .bind(Uuid::now_v7())
    .bind(session_id)
    .bind(risk_score)
    .bind(reason)
    .fetch_one(db)
    .await?;

    Ok(row.into_handoff())
}

pub async fn list_handoffs(
    db: &PgPool,
    status: Option<HandoffStatus>,
    limit: i64,
) -> Result<Vec<HumanHandoff>, AppError> {
    let rows = if let Some(status) = status {
        sqlx::query_as::<_, HandoffRow>(
            "SELECT id, session_id, status, risk_score, reason, created_at, \
                    acknowledged_at, acknowledged_by \
             FROM human_handoffs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(db)
        .await?
    } else {
        sqlx::query_as::<_, HandoffRow>(
            "SELECT id, session_id, status, risk_score, reason, created_at, \
                    acknowledged_at, acknowledged_by \
             FROM human_handoffs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(db)
        .await?
    };

    Ok(rows.into_iter().map(|r| r.into_handoff()).collect())
}

/// Conditional pending→acknowledged transition. Returns
/// `(handoff, already_acknowledged)`.
pub async fn acknowledge_handoff(
    db: &PgPool,
    handoff_id: Uuid,
    supervisor_id: Option<Uuid>,
) -> Result<(HumanHandoff, bool), AppError> {
    let updated = sqlx::query_as::<_, HandoffRow>(
        "UPDATE human_handoffs SET status = 'acknowledged', acknowledged_at = NOW(), \
                acknowledged_by = $2 \
         WHERE id = $1 AND status = 'pending' \
         RETURNING id, session_id, status, risk_score, reason, created_at, \
                   acknowledged_at, acknowledged_by",
    )
    .bind(handoff_id)
    .bind(supervisor_id)
    .fetch_optional(db)
    .await?;

    if let Some(row) = updated {
        return Ok((row.into_handoff(), false));
    }

    let row = sqlx::query_as::<_, HandoffRow>(
        "SELECT id, session_id, status, risk_score, reason, created_at, \
                acknowledged_at, acknowledged_by \
         FROM human_handoffs WHERE id = $1",
    )
    .bind(handoff_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("handoff {handoff_id}"),
    })?;

    Ok((row.into_handoff(), true))
}

#[derive(sqlx::FromRow)]
struct HandoffRow {
    id: Uuid,
    session_id: String,
    status: String,
    risk_score: i32,
    reason: String,
    created_at: chrono::DateTime<chrono::Utc>,
    acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
    acknowledged_by: Option<Uuid>,
}

impl HandoffRow {
    fn into_handoff(self) -> HumanHandoff {
        HumanHandoff {
            id: self.id,
            session_id: self.session_id,
            status: HandoffStatus::parse(&self.status).unwrap_or(HandoffStatus::Pending),
            risk_score: self.risk_score,
            reason: self.reason,
            created_at: self.created_at,
            acknowledged_at: self.acknowledged_at,
            acknowledged_by: self.acknowledged_by,
        }
    }
}
