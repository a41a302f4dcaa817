use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single well-known channel all supervisory observers subscribe to,
/// distinct from per-session topics.
pub const BROADCAST_TOPIC: &str = "supervisors";

/// Topic name for one session's observers.
pub fn session_topic(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Event names published on the bus. Delivery is at-most-once and
/// best-effort — the durable record of truth is always the store.
pub mod events {
    pub const SESSION_CREATED: &str = "session:created";
    pub const SESSION_STATUS: &str = "session:status";
    pub const MESSAGES_NEW: &str = "messages:new";
    pub const CRISIS_DETECTED: &str = "session:crisis-detected";
    pub const CRISIS_FLAGGED: &str = "session:crisis-flagged";
    pub const CRISIS_UNFLAGGED: &str = "session:crisis-unflagged";
    pub const CRISIS_EMERGENCY: &str = "session:crisis-emergency";
    pub const SUPERVISOR_REVIEW_REQUIRED: &str = "session:supervisor-review-required";
}

/// Envelope for every event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// One of the names in [`events`]
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(event: &str, session_id: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            payload,
            at: Utc::now(),
        }
    }
}
