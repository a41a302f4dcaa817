use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use haven_core::realtime::{BROADCAST_TOPIC, RealtimeEvent};

use crate::bus::EventBus;
use crate::error::AppError;
use crate::identity::extract_identity;
use crate::state::AppState;

/// Buffered events per connection between the bus and the socket write loop.
const FORWARD_BUFFER: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/realtime", get(subscribe))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SubscribeParams {
    /// Comma-separated topic list: `session:<id>` and/or `supervisors`
    pub topics: String,
}

/// Subscribe to real-time events over WebSocket
///
/// One connection may join many topics. Delivery is best-effort and
/// at-most-once: events published before the connection existed are never
/// replayed, and a lagging connection silently misses events. The durable
/// record is always the store.
#[utoipa::path(
    get,
    path = "/v1/realtime",
    params(SubscribeParams),
    responses(
        (status = 101, description = "WebSocket upgrade"),
        (status = 400, description = "Validation error"),
        (status = 403, description = "Broadcast topic requires supervisor role")
    ),
    tag = "realtime"
)]
pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SubscribeParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = extract_identity(&headers)?;

    let topics: Vec<String> = params
        .topics
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if topics.is_empty() {
        return Err(AppError::Validation {
            message: "topics must name at least one topic".to_string(),
            field: Some("topics".to_string()),
            received: Some(serde_json::Value::String(params.topics)),
            docs_hint: Some("Example: topics=session:sess_abc123,supervisors".to_string()),
        });
    }

    for topic in &topics {
        if topic == BROADCAST_TOPIC {
            identity.require_supervisor("subscribe to the broadcast topic")?;
        } else if !topic.starts_with("session:") {
            return Err(AppError::Validation {
                message: format!("Unknown topic shape '{topic}'"),
                field: Some("topics".to_string()),
                received: Some(serde_json::Value::String(topic.clone())),
                docs_hint: Some(
                    "Topics are either session:<id> or the supervisors broadcast.".to_string(),
                ),
            });
        }
    }

    let bus = state.bus.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, bus, topics)))
}

async fn handle_socket(socket: WebSocket, bus: EventBus, topics: Vec<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RealtimeEvent>(FORWARD_BUFFER);

    for topic in topics {
        let mut subscription = bus.subscribe(&topic);
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Slow consumer: events between the cursor and head are
                    // gone. That is the contract, not an error.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(topic, skipped, "subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    drop(tx);

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Watch the client side for close/disconnect while the writer drains
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other client frames are ignored
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
}
