use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use haven_core::error::ApiError;
use haven_core::messages::{
    BatchCreateMessagesRequest, BatchCreateMessagesResponse, Message, MessageRole, MessageView,
    PaginatedResponse, TranscriptAudience,
};
use haven_core::realtime::{RealtimeEvent, events};
use haven_core::sessions::SessionStatus;

use crate::bus::EventBus;
use crate::error::AppError;
use crate::identity::{Identity, extract_identity};
use crate::registry;
use crate::routes::sessions::authorize_session_access;
use crate::state::AppState;

const MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MESSAGE_TYPE: &str = "chat";

pub fn write_router() -> Router<AppState> {
    Router::new().route("/v1/sessions/{session_id}/messages", post(create_messages))
}

pub fn read_router() -> Router<AppState> {
    Router::new().route("/v1/sessions/{session_id}/messages", get(list_messages))
}

/// A message prepared for insertion: content already redacted (or pending).
pub struct NewMessage {
    pub role: MessageRole,
    pub message_type: String,
    pub content: String,
    pub redacted_content: Option<String>,
    pub metadata: serde_json::Value,
}

/// Insert a batch of messages in one transaction, preserving arrival order.
/// A Session/Message pair is never partially committed — any failure rolls
/// the whole batch back.
pub async fn insert_messages_internal(
    db: &sqlx::PgPool,
    session_id: &str,
    batch: Vec<NewMessage>,
) -> Result<Vec<Message>, AppError> {
    let mut tx = db.begin().await?;
    let mut created = Vec::with_capacity(batch.len());

    for msg in batch {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (id, session_id, role, message_type, content, redacted_content, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, session_id, role, message_type, content, redacted_content, metadata, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(session_id)
        .bind(msg.role.as_str())
        .bind(&msg.message_type)
        .bind(&msg.content)
        .bind(&msg.redacted_content)
        .bind(&msg.metadata)
        .fetch_one(&mut *tx)
        .await?;

        created.push(row.into_message());
    }

    tx.commit().await?;
    Ok(created)
}

/// Publish `messages:new` for a freshly persisted batch: user-audience views
/// to the session topic, redaction-applied supervisor views to the broadcast
/// topic. Hidden guidance reaches neither.
pub fn publish_new_messages(bus: &EventBus, session_id: &str, messages: &[Message]) {
    let user_views: Vec<MessageView> = messages
        .iter()
        .filter_map(|m| m.view_for(TranscriptAudience::User))
        .collect();
    if !user_views.is_empty() {
        bus.publish_session(
            session_id,
            RealtimeEvent::new(
                events::MESSAGES_NEW,
                Some(session_id),
                json!({ "messages": user_views }),
            ),
        );
    }

    let supervisor_views: Vec<MessageView> = messages
        .iter()
        .filter_map(|m| m.view_for(TranscriptAudience::Supervisor))
        .collect();
    if !supervisor_views.is_empty() {
        bus.publish_broadcast(RealtimeEvent::new(
            events::MESSAGES_NEW,
            Some(session_id),
            json!({ "messages": supervisor_views }),
        ));
    }
}

/// Append messages to a session transcript
///
/// The batch is redacted, persisted atomically in arrival order, published
/// to observers, and then evaluated by the crisis engine. If the redaction
/// service is down, messages persist with redaction pending and a background
/// sweep completes them — ingestion never silently drops a message.
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/messages",
    request_body = BatchCreateMessagesRequest,
    responses(
        (status = 201, description = "Messages created", body = BatchCreateMessagesResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = String, Path, description = "Session id")
    ),
    tag = "messages"
)]
pub async fn create_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BatchCreateMessagesRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = extract_identity(&headers)?;
    let session = registry::get_session(&state.db, &session_id).await?;
    authorize_session_access(&identity, &session)?;

    if session.status != SessionStatus::Active {
        return Err(AppError::Validation {
            message: "Session has already ended".to_string(),
            field: Some("session_id".to_string()),
            received: Some(serde_json::Value::String(session_id)),
            docs_hint: Some("Start a new session to continue the conversation.".to_string()),
        });
    }

    if req.messages.is_empty() {
        return Err(AppError::Validation {
            message: "messages array must not be empty".to_string(),
            field: Some("messages".to_string()),
            received: None,
            docs_hint: Some("Provide at least one message in the batch.".to_string()),
        });
    }

    if req.messages.len() > MAX_BATCH_SIZE {
        return Err(AppError::Validation {
            message: format!(
                "Batch size {} exceeds maximum of {MAX_BATCH_SIZE}",
                req.messages.len()
            ),
            field: Some("messages".to_string()),
            received: Some(json!(req.messages.len())),
            docs_hint: Some(format!("Split large batches into chunks of {MAX_BATCH_SIZE} or fewer.")),
        });
    }

    let mut prepared = Vec::with_capacity(req.messages.len());
    for msg in req.messages {
        let redacted_content = if msg.content.is_empty() {
            Some(String::new())
        } else {
            match state.redaction.redact(&msg.content).await {
                Ok(redacted) => Some(redacted),
                Err(err) => {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "redaction failed at ingestion; persisting with redaction pending"
                    );
                    None
                }
            }
        };

        prepared.push(NewMessage {
            role: msg.role,
            message_type: msg
                .message_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            content: msg.content,
            redacted_content,
            metadata: msg.metadata.unwrap_or_else(|| json!({})),
        });
    }

    let created = insert_messages_internal(&state.db, &session.id, prepared).await?;

    publish_new_messages(&state.bus, &session.id, &created);

    // Crisis evaluation observes the persisted transcript. Its own writes
    // failing must not fail an ingestion that already committed.
    let configuration = registry::get_configuration(&state.db, &session.id).await?;
    if let Err(err) = crate::crisis::evaluate_session(
        &state,
        &session.id,
        &configuration.language,
        created.last().map(|m| m.id),
    )
    .await
    {
        tracing::error!(session_id = %session.id, error = ?err, "crisis evaluation failed");
    }

    let redaction_pending = created
        .iter()
        .filter(|m| m.redacted_content.is_none() && !m.content.is_empty())
        .count();

    Ok((
        StatusCode::CREATED,
        Json(BatchCreateMessagesResponse {
            messages: created,
            redaction_pending,
        }),
    ))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListMessagesParams {
    /// Audience the transcript is assembled for. Defaults to supervisor for
    /// staff callers, user otherwise.
    #[serde(default)]
    pub view: Option<TranscriptAudience>,
    /// Maximum number of messages to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Cursor for pagination (opaque string from previous response's next_cursor)
    #[serde(default)]
    pub cursor: Option<String>,
}

fn authorize_audience(
    identity: &Identity,
    session: &haven_core::sessions::Session,
    audience: TranscriptAudience,
) -> Result<(), AppError> {
    match audience {
        TranscriptAudience::User => {
            let is_owner = match session.user_id {
                None => true,
                Some(owner) => identity.user_id == Some(owner),
            };
            if is_owner {
                Ok(())
            } else {
                Err(AppError::Forbidden {
                    message: "The user view is only available to the session owner".to_string(),
                    docs_hint: Some("Staff should request view=supervisor.".to_string()),
                })
            }
        }
        TranscriptAudience::Supervisor => identity.require_supervisor("supervisor transcript view"),
        TranscriptAudience::Provider => identity.require_admin("provider transcript feed"),
    }
}

/// Read a session transcript
///
/// Messages come back in arrival order with cursor pagination. The view
/// controls what each audience may see: the user view excludes hidden
/// guidance; the supervisor view additionally carries only redacted content
/// and withholds messages whose redaction is still pending; the provider
/// feed is the complete raw channel, hidden turns included.
#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/messages",
    params(
        ListMessagesParams,
        ("session_id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Paginated transcript view", body = PaginatedResponse<MessageView>),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    tag = "messages"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<PaginatedResponse<MessageView>>, AppError> {
    let identity = extract_identity(&headers)?;
    let session = registry::get_session(&state.db, &session_id).await?;

    let audience = params.view.unwrap_or(if identity.is_supervisor() {
        TranscriptAudience::Supervisor
    } else {
        TranscriptAudience::User
    });
    authorize_audience(&identity, &session, audience)?;

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    // Fetch one extra to determine has_more
    let fetch_limit = limit + 1;

    let cursor_data = if let Some(ref cursor_str) = params.cursor {
        Some(decode_cursor(cursor_str)?)
    } else {
        None
    };

    let rows = if let Some(ref cursor) = cursor_data {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, session_id, role, message_type, content, redacted_content, metadata, created_at
            FROM messages
            WHERE session_id = $1
              AND (created_at, id) > ($2, $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(&session_id)
        .bind(cursor.created_at)
        .bind(cursor.id)
        .bind(fetch_limit)
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, session_id, role, message_type, content, redacted_content, metadata, created_at
            FROM messages
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(&session_id)
        .bind(fetch_limit)
        .fetch_all(&state.db)
        .await?
    };

    let has_more = rows.len() as i64 > limit;
    let page: Vec<Message> = rows
        .into_iter()
        .take(limit as usize)
        .map(|r| r.into_message())
        .collect();

    // The cursor advances over the raw page, not the filtered view, so
    // audience filtering never skips rows between pages
    let next_cursor = if has_more {
        page.last().map(|m| encode_cursor(&m.created_at, &m.id))
    } else {
        None
    };

    let data: Vec<MessageView> = page
        .iter()
        .filter_map(|m| m.view_for(audience))
        .collect();

    Ok(Json(PaginatedResponse {
        data,
        next_cursor,
        has_more,
    }))
}

/// Cursor is base64("created_at\0id") — opaque to the client, stable for
/// pagination
fn encode_cursor(created_at: &DateTime<Utc>, id: &Uuid) -> String {
    use base64::Engine;
    let raw = format!("{}\0{}", created_at.to_rfc3339(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

struct CursorData {
    created_at: DateTime<Utc>,
    id: Uuid,
}

fn decode_cursor(cursor: &str) -> Result<CursorData, AppError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AppError::Validation {
            message: "Invalid cursor format".to_string(),
            field: Some("cursor".to_string()),
            received: Some(serde_json::Value::String(cursor.to_string())),
            docs_hint: Some("Use the next_cursor value from a previous response.".to_string()),
        })?;

    let s = String::from_utf8(bytes).map_err(|_| AppError::Validation {
        message: "Invalid cursor encoding".to_string(),
        field: Some("cursor".to_string()),
        received: None,
        docs_hint: None,
    })?;

    let parts: Vec<&str> = s.splitn(2, '\0').collect();
    if parts.len() != 2 {
        return Err(AppError::Validation {
            message: "Invalid cursor structure".to_string(),
            field: Some("cursor".to_string()),
            received: None,
            docs_hint: Some("Use the next_cursor value from a previous response.".to_string()),
        });
    }

    let created_at = DateTime::parse_from_rfc3339(parts[0])
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::Validation {
            message: "Invalid cursor timestamp".to_string(),
            field: Some("cursor".to_string()),
            received: None,
            docs_hint: None,
        })?;

    let id = Uuid::parse_str(parts[1]).map_err(|_| AppError::Validation {
        message: "Invalid cursor id".to_string(),
        field: Some("cursor".to_string()),
        received: None,
        docs_hint: None,
    })?;

    Ok(CursorData { created_at, id })
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    session_id: String,
    role: String,
    message_type: String,
    content: String,
    redacted_content: Option<String>,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            id: self.id,
            session_id: self.session_id,
            role: MessageRole::parse(&self.role).unwrap_or(MessageRole::System),
            message_type: self.message_type,
            content: self.content,
            redacted_content: self.redacted_content,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{decode_cursor, encode_cursor};

    #[test]
    fn cursor_round_trips() {
        let created_at = Utc::now();
        let id = Uuid::now_v7();

        let cursor = encode_cursor(&created_at, &id);
        let decoded = decode_cursor(&cursor).unwrap();

        assert_eq!(decoded.created_at, created_at);
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn garbage_cursors_are_rejected() {
        assert!(decode_cursor("not base64 at all!").is_err());

        use base64::Engine;
        let no_separator = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"justtext");
        assert!(decode_cursor(&no_separator).is_err());
    }
}
