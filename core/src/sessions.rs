use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crisis::CrisisSeverity;
use crate::policy::QuotaLimits;

/// One continuous conversational engagement between a user and the AI
/// provider, with a definite start and (eventually) end.
///
/// Session ids are opaque strings: the upstream provider may issue them, or
/// they are generated locally (`sess_<uuid>`). Sessions are never deleted by
/// this service — ending a session is a status transition, not a removal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: String,
    /// Owning user. None for anonymous sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<EndedBy>,
    pub crisis_flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crisis_severity: Option<CrisisSeverity>,
    /// 0–100 risk estimate from the most recent crisis evaluation or manual flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crisis_risk_score: Option<i32>,
    pub monitoring_frequency: MonitoringFrequency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

/// Who terminated a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndedBy {
    User,
    Admin,
    /// Auto-termination by the scheduler or reconciliation sweep
    System,
}

impl EndedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndedBy::User => "user",
            EndedBy::Admin => "admin",
            EndedBy::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(EndedBy::User),
            "admin" => Some(EndedBy::Admin),
            "system" => Some(EndedBy::System),
            _ => None,
        }
    }
}

/// How closely supervisory staff should watch a session. Raised by the
/// crisis engine (medium → high, high → critical), never lowered by it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringFrequency {
    Normal,
    High,
    Critical,
}

impl MonitoringFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringFrequency::Normal => "normal",
            MonitoringFrequency::High => "high",
            MonitoringFrequency::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(MonitoringFrequency::Normal),
            "high" => Some(MonitoringFrequency::High),
            "critical" => Some(MonitoringFrequency::Critical),
            _ => None,
        }
    }
}

/// Provider-facing session parameters. Immutable after creation; the crisis
/// engine reads `language` when composing localized intervention text.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionConfiguration {
    pub session_id: String,
    pub voice: String,
    /// BCP-47-ish language tag, e.g. "en", "es"
    pub language: String,
    pub max_duration_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Request to start a session
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    /// Session id issued by the upstream provider. Generated locally if absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Response for session start. `existing=true` means an active session for
/// this user already existed and was returned instead of creating a second
/// one — informational, not an error.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartSessionResponse {
    #[serde(flatten)]
    pub session: Session,
    pub configuration: SessionConfiguration,
    pub existing: bool,
    /// Active policy limits, so the client can arm a visible countdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<QuotaLimits>,
}

/// Response for session end. `already_ended=true` means the session was
/// already terminal — the call was a no-op and no side effects re-fired.
#[derive(Debug, Serialize, ToSchema)]
pub struct EndSessionResponse {
    #[serde(flatten)]
    pub session: Session,
    pub already_ended: bool,
}

#[cfg(test)]
mod tests {
    use super::{EndedBy, MonitoringFrequency, SessionStatus};

    #[test]
    fn status_round_trips_through_strings() {
        for status in [SessionStatus::Active, SessionStatus::Ended] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("paused"), None);
    }

    #[test]
    fn ended_by_round_trips_through_strings() {
        for ended_by in [EndedBy::User, EndedBy::Admin, EndedBy::System] {
            assert_eq!(EndedBy::parse(ended_by.as_str()), Some(ended_by));
        }
    }

    #[test]
    fn monitoring_frequency_orders_by_escalation() {
        assert!(MonitoringFrequency::Normal < MonitoringFrequency::High);
        assert!(MonitoringFrequency::High < MonitoringFrequency::Critical);
    }
}
