use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A single transcript message. Messages are immutable once written, except
/// that `redacted_content` is filled in asynchronously when the redaction
/// gateway was unavailable at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Unique message ID (UUIDv7 — time-sortable, preserves arrival order)
    pub id: Uuid,
    pub session_id: String,
    pub role: MessageRole,
    /// Free-form tag: "chat", "voice", "crisis_intervention", "ai_guidance",
    /// "admin_visible". NOT an enum — new tags emerge from usage.
    pub message_type: String,
    /// Raw content as received
    pub content: String,
    /// Privacy-scrubbed variant. None until redaction completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_content: Option<String>,
    /// Structured metadata; `hidden_from_user: true` marks guidance turns
    /// that only the upstream-AI channel may see
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

impl Message {
    /// A guidance turn injected for the upstream AI. Never rendered to the
    /// end user and never shown to supervisors — only the provider feed.
    pub fn hidden_from_user(&self) -> bool {
        self.metadata
            .get("hidden_from_user")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Project this message into a view, or None if the audience must not
    /// see it. Supervisor views withhold messages whose redaction is still
    /// pending rather than leak raw content.
    pub fn view_for(&self, audience: TranscriptAudience) -> Option<MessageView> {
        let content = match audience {
            TranscriptAudience::User => {
                if self.hidden_from_user() {
                    return None;
                }
                self.content.clone()
            }
            TranscriptAudience::Supervisor => {
                if self.hidden_from_user() {
                    return None;
                }
                self.redacted_content.clone()?
            }
            TranscriptAudience::Provider => self.content.clone(),
        };

        Some(MessageView {
            id: self.id,
            session_id: self.session_id.clone(),
            role: self.role,
            message_type: self.message_type.clone(),
            content,
            hidden_from_user: self.hidden_from_user(),
            created_at: self.created_at,
        })
    }
}

/// Who a transcript view is assembled for.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptAudience {
    /// The end user: raw content, hidden guidance excluded
    User,
    /// Supervisory staff: redacted content only, hidden guidance excluded
    Supervisor,
    /// The upstream-AI conversational channel: everything, raw
    Provider,
}

/// A message as exposed to a particular audience.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessageView {
    pub id: Uuid,
    pub session_id: String,
    pub role: MessageRole,
    pub message_type: String,
    pub content: String,
    /// Marked so UI collaborators on the provider feed never render it
    pub hidden_from_user: bool,
    pub created_at: DateTime<Utc>,
}

/// Request to append one message to a session transcript
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateMessageRequest {
    pub role: MessageRole,
    /// Defaults to "chat"
    #[serde(default)]
    pub message_type: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Request to append a batch of messages in arrival order
#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchCreateMessagesRequest {
    pub messages: Vec<CreateMessageRequest>,
}

/// Response for batch message creation. Messages whose redaction is still
/// pending have `redacted_content` null; a background sweep completes them.
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchCreateMessagesResponse {
    pub messages: Vec<Message>,
    /// How many messages in this batch are awaiting redaction
    pub redaction_pending: usize,
}

/// Cursor-based pagination
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Cursor for the next page. None if this is the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether there are more results after this page
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::{Message, MessageRole, TranscriptAudience};

    fn message(metadata: serde_json::Value, redacted: Option<&str>) -> Message {
        Message {
            id: Uuid::now_v7(),
            session_id: "sess_test".to_string(),
            role: MessageRole::System,
            message_type: "ai_guidance".to_string(),
            content: "raw content".to_string(),
            redacted_content: redacted.map(|s| s.to_string()),
            metadata,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn hidden_messages_never_reach_user_or_supervisor_views() {
        let msg = message(json!({"hidden_from_user": true}), Some("scrubbed"));

        assert!(msg.view_for(TranscriptAudience::User).is_none());
        assert!(msg.view_for(TranscriptAudience::Supervisor).is_none());

        let provider_view = msg.view_for(TranscriptAudience::Provider).unwrap();
        assert_eq!(provider_view.content, "raw content");
        assert!(provider_view.hidden_from_user);
    }

    #[test]
    fn supervisor_view_uses_redacted_content() {
        let msg = message(json!({}), Some("scrubbed"));

        let view = msg.view_for(TranscriptAudience::Supervisor).unwrap();
        assert_eq!(view.content, "scrubbed");

        let user_view = msg.view_for(TranscriptAudience::User).unwrap();
        assert_eq!(user_view.content, "raw content");
    }

    #[test]
    fn supervisor_view_withholds_messages_pending_redaction() {
        let msg = message(json!({}), None);
        assert!(msg.view_for(TranscriptAudience::Supervisor).is_none());
        // The user still sees their own raw message
        assert!(msg.view_for(TranscriptAudience::User).is_some());
    }

    #[test]
    fn malformed_hidden_flag_defaults_to_visible() {
        let msg = message(json!({"hidden_from_user": "yes"}), Some("scrubbed"));
        assert!(!msg.hidden_from_user());
    }
}
