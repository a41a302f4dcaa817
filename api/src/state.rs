use std::sync::Arc;

use sqlx::PgPool;

use crate::bus::EventBus;
use crate::provider::ConversationProvider;
use crate::quota::QuotaEnforcer;
use crate::redaction::RedactionClient;
use crate::scheduler::TerminationScheduler;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub bus: EventBus,
    pub scheduler: TerminationScheduler,
    pub quota: QuotaEnforcer,
    pub redaction: Arc<dyn RedactionClient>,
    pub provider: Arc<dyn ConversationProvider>,
}
