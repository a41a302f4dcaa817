use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use haven_core::realtime::{RealtimeEvent, events};
use haven_core::sessions::{
    EndedBy, MonitoringFrequency, Session, SessionConfiguration, SessionStatus,
    StartSessionRequest,
};

use crate::bus::EventBus;
use crate::error::AppError;
use crate::scheduler::TerminationScheduler;

pub const SESSION_TIME_LIMIT_REASON: &str = "Session time limit reached";

const DEFAULT_VOICE: &str = "calm";
const DEFAULT_LANGUAGE: &str = "en";

/// Look up the caller's currently-active session, if any. At most one can
/// exist — the store enforces it with a unique partial index.
pub async fn find_active_for_user(
    db: &PgPool,
    user_id: Uuid,
) -> Result<Option<Session>, AppError> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                crisis_severity, crisis_risk_score, monitoring_frequency \
         FROM sessions WHERE user_id = $1 AND status = 'active'",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| r.into_session()))
}

/// Create a session, or return the caller's existing active one.
///
/// Idempotent under concurrent duplicate requests: the pre-check catches the
/// common case, the unique partial index catches the race, and the
/// conditional insert on the (possibly provider-issued) id absorbs retried
/// client calls. Returns `(session, configuration, existing)`.
pub async fn start_session(
    db: &PgPool,
    user_id: Option<Uuid>,
    req: &StartSessionRequest,
    default_duration_minutes: i64,
) -> Result<(Session, SessionConfiguration, bool), AppError> {
    if let Some(user_id) = user_id {
        if let Some(existing) = find_active_for_user(db, user_id).await? {
            let configuration = get_configuration(db, &existing.id).await?;
            return Ok((existing, configuration, true));
        }
    }

    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(|| format!("sess_{}", Uuid::now_v7().simple()));

    let mut tx = db.begin().await?;

    let insert_result = sqlx::query_as::<_, SessionRow>(
        "INSERT INTO sessions (id, user_id) VALUES ($1, $2) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                   crisis_severity, crisis_risk_score, monitoring_frequency",
    )
    .bind(&session_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await;

    let inserted = match insert_result {
        Ok(row) => row,
        // The one-active-per-user partial index fired: another request for
        // this user won the race. Return the winner.
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            drop(tx);
            if let Some(user_id) = user_id {
                if let Some(existing) = find_active_for_user(db, user_id).await? {
                    let configuration = get_configuration(db, &existing.id).await?;
                    return Ok((existing, configuration, true));
                }
            }
            return Err(AppError::Internal(
                "session insert conflicted without a surviving active session".to_string(),
            ));
        }
        Err(err) => return Err(err.into()),
    };

    let Some(row) = inserted else {
        // The id already exists — a retried client call with a
        // provider-issued id. Hand back what the first attempt created.
        drop(tx);
        let session = get_session(db, &session_id).await?;
        let configuration = get_configuration(db, &session_id).await?;
        return Ok((session, configuration, true));
    };

    let configuration = SessionConfiguration {
        session_id: session_id.clone(),
        voice: req.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string()),
        language: req
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        max_duration_minutes: default_duration_minutes,
        instructions: req.instructions.clone(),
    };

    sqlx::query(
        "INSERT INTO session_configurations \
         (session_id, voice, language, max_duration_minutes, instructions) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&configuration.session_id)
    .bind(&configuration.voice)
    .bind(&configuration.language)
    .bind(configuration.max_duration_minutes)
    .bind(&configuration.instructions)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok((row.into_session(), configuration, false))
}

pub async fn get_session(db: &PgPool, session_id: &str) -> Result<Session, AppError> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                crisis_severity, crisis_risk_score, monitoring_frequency \
         FROM sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("session {session_id}"),
    })?;

    Ok(row.into_session())
}

pub async fn get_configuration(
    db: &PgPool,
    session_id: &str,
) -> Result<SessionConfiguration, AppError> {
    let row = sqlx::query_as::<_, ConfigurationRow>(
        "SELECT session_id, voice, language, max_duration_minutes, instructions \
         FROM session_configurations WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("configuration for session {session_id}"),
    })?;

    Ok(row.into_configuration())
}

pub async fn list_sessions(
    db: &PgPool,
    status: Option<SessionStatus>,
    limit: i64,
) -> Result<Vec<Session>, AppError> {
    let rows = if let Some(status) = status {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                    crisis_severity, crisis_risk_score, monitoring_frequency \
             FROM sessions WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(db)
        .await?
    } else {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                    crisis_severity, crisis_risk_score, monitoring_frequency \
             FROM sessions ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(db)
        .await?
    };

    Ok(rows.into_iter().map(|r| r.into_session()).collect())
}

/// Transition a session to `ended`. The single authoritative state change is
/// the conditional update — two concurrent callers converge on one terminal
/// state and side effects fire exactly once, on the caller that won.
///
/// Returns `(session, already_ended)`.
pub async fn end_session(
    db: &PgPool,
    bus: &EventBus,
    scheduler: &TerminationScheduler,
    session_id: &str,
    ended_by: EndedBy,
    remote_termination: bool,
    reason: Option<&str>,
) -> Result<(Session, bool), AppError> {
    let updated = sqlx::query_as::<_, SessionRow>(
        "UPDATE sessions SET status = 'ended', ended_at = NOW(), ended_by = $2 \
         WHERE id = $1 AND status = 'active' \
         RETURNING id, user_id, status, created_at, ended_at, ended_by, crisis_flagged, \
                   crisis_severity, crisis_risk_score, monitoring_frequency",
    )
    .bind(session_id)
    .bind(ended_by.as_str())
    .fetch_optional(db)
    .await?;

    let Some(row) = updated else {
        // Lost the race or the session was already terminal. No side
        // effects re-fire on the repeat path.
        return match get_session(db, session_id).await {
            Ok(session) => Ok((session, true)),
            Err(err) => Err(err),
        };
    };

    let session = row.into_session();
    scheduler.disarm(session_id);

    let mut payload = json!({
        "status": "ended",
        "ended_by": ended_by.as_str(),
    });
    if remote_termination {
        payload["remote_termination"] = json!(true);
    }
    if let Some(reason) = reason {
        payload["reason"] = json!(reason);
    }

    let event = RealtimeEvent::new(events::SESSION_STATUS, Some(session_id), payload);
    bus.publish_session(session_id, event.clone());
    bus.publish_broadcast(event);

    tracing::info!(session_id, ended_by = ended_by.as_str(), "session ended");

    Ok((session, false))
}

/// End path for the scheduler and the reconciliation sweep. Returns whether
/// this call performed the transition (false: it had already ended).
pub async fn end_expired_session(
    db: &PgPool,
    bus: &EventBus,
    scheduler: &TerminationScheduler,
    session_id: &str,
) -> Result<bool, AppError> {
    let (_, already_ended) = end_session(
        db,
        bus,
        scheduler,
        session_id,
        EndedBy::System,
        true,
        Some(SESSION_TIME_LIMIT_REASON),
    )
    .await?;
    Ok(!already_ended)
}

/// Claim and end active sessions whose configured duration elapsed without
/// an in-process timer firing (typically after a restart dropped the timer
/// table). Any instance may run this; the conditional update keeps
/// concurrent sweeps from double-processing.
pub async fn sweep_expired_sessions(
    db: &PgPool,
    bus: &EventBus,
    scheduler: &TerminationScheduler,
) -> Result<u64, AppError> {
    let expired: Vec<String> = sqlx::query_scalar(
        "SELECT s.id FROM sessions s \
         JOIN session_configurations c ON c.session_id = s.id \
         WHERE s.status = 'active' \
           AND s.created_at + make_interval(mins => c.max_duration_minutes::int) < NOW()",
    )
    .fetch_all(db)
    .await?;

    let mut ended = 0u64;
    for session_id in expired {
        match end_expired_session(db, bus, scheduler, &session_id).await {
            Ok(true) => ended += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(session_id, error = ?err, "expiry sweep failed to end session");
            }
        }
    }

    Ok(ended)
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
pub struct SessionRow {
    id: String,
    user_id: Option<Uuid>,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    ended_by: Option<String>,
    crisis_flagged: bool,
    crisis_severity: Option<String>,
    crisis_risk_score: Option<i32>,
    monitoring_frequency: String,
}

impl SessionRow {
    pub fn into_session(self) -> Session {
        Session {
            id: self.id,
            user_id: self.user_id,
            // The store CHECK-constrains these columns; unknown values can
            // only mean a newer writer, so fall back conservatively
            status: SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Ended),
            created_at: self.created_at,
            ended_at: self.ended_at,
            ended_by: self.ended_by.as_deref().and_then(EndedBy::parse),
            crisis_flagged: self.crisis_flagged,
            crisis_severity: self
                .crisis_severity
                .as_deref()
                .and_then(haven_core::crisis::CrisisSeverity::parse),
            crisis_risk_score: self.crisis_risk_score,
            monitoring_frequency: MonitoringFrequency::parse(&self.monitoring_frequency)
                .unwrap_or(MonitoringFrequency::Normal),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigurationRow {
    session_id: String,
    voice: String,
    language: String,
    max_duration_minutes: i64,
    instructions: Option<String>,
}

impl ConfigurationRow {
    fn into_configuration(self) -> SessionConfiguration {
        SessionConfiguration {
            session_id: self.session_id,
            voice: self.voice,
            language: self.language,
            max_duration_minutes: self.max_duration_minutes,
            instructions: self.instructions,
        }
    }
}
