use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use haven_core::messages::MessageRole;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Boundary to the upstream generative-AI provider's conversational channel.
/// The crisis engine injects both user-visible and hidden turns here; hidden
/// turns steer the model and are flagged so UI collaborators never render
/// them.
#[async_trait]
pub trait ConversationProvider: Send + Sync {
    async fn inject_turn(
        &self,
        session_id: &str,
        role: MessageRole,
        text: &str,
        hidden: bool,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, Serialize)]
struct TurnRequest<'a> {
    role: &'a str,
    text: &'a str,
    hidden: bool,
}

pub struct HttpConversationProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpConversationProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build provider http client");
        Self {
            http,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl ConversationProvider for HttpConversationProvider {
    async fn inject_turn(
        &self,
        session_id: &str,
        role: MessageRole,
        text: &str,
        hidden: bool,
    ) -> Result<(), ProviderError> {
        self.http
            .post(format!("{}/v1/sessions/{session_id}/turns", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&TurnRequest {
                role: role.as_str(),
                text,
                hidden,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no provider URL is configured (local development, tests).
/// Injections are logged and dropped.
pub struct DisabledConversationProvider;

#[async_trait]
impl ConversationProvider for DisabledConversationProvider {
    async fn inject_turn(
        &self,
        session_id: &str,
        _role: MessageRole,
        _text: &str,
        hidden: bool,
    ) -> Result<(), ProviderError> {
        tracing::debug!(session_id, hidden, "provider disabled; dropping injected turn");
        Ok(())
    }
}
