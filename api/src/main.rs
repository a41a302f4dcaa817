use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod bus;
mod crisis;
mod error;
mod identity;
mod middleware;
mod provider;
mod quota;
mod redaction;
mod registry;
mod routes;
mod scheduler;
mod state;

use crate::bus::EventBus;
use crate::provider::{ConversationProvider, DisabledConversationProvider, HttpConversationProvider};
use crate::quota::QuotaEnforcer;
use crate::redaction::HttpRedactionClient;
use crate::scheduler::TerminationScheduler;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Haven Session API",
        version = "0.1.0",
        description = "Session lifecycle, quota enforcement, real-time events, and graduated \
                       crisis response for AI-assisted support conversations."
    ),
    paths(
        routes::health::health_check,
        routes::sessions::start_session,
        routes::sessions::end_session,
        routes::sessions::get_session,
        routes::sessions::list_sessions,
        routes::messages::create_messages,
        routes::messages::list_messages,
        routes::quota::check_quota,
        routes::quota::get_policy,
        routes::crisis::flag_session,
        routes::crisis::unflag_session,
        routes::crisis::list_handoffs,
        routes::crisis::acknowledge_handoff,
        routes::realtime::subscribe,
    ),
    components(schemas(
        HealthResponse,
        haven_core::error::ApiError,
        haven_core::sessions::Session,
        haven_core::sessions::SessionStatus,
        haven_core::sessions::EndedBy,
        haven_core::sessions::MonitoringFrequency,
        haven_core::sessions::SessionConfiguration,
        haven_core::sessions::StartSessionRequest,
        haven_core::sessions::StartSessionResponse,
        haven_core::sessions::EndSessionResponse,
        haven_core::messages::Message,
        haven_core::messages::MessageRole,
        haven_core::messages::MessageView,
        haven_core::messages::TranscriptAudience,
        haven_core::messages::CreateMessageRequest,
        haven_core::messages::BatchCreateMessagesRequest,
        haven_core::messages::BatchCreateMessagesResponse,
        haven_core::messages::PaginatedResponse<haven_core::messages::MessageView>,
        haven_core::policy::QuotaPolicy,
        haven_core::policy::QuotaLimits,
        haven_core::policy::QuotaDecision,
        haven_core::policy::QuotaDenialReason,
        haven_core::crisis::CrisisSeverity,
        haven_core::crisis::RiskAssessment,
        haven_core::crisis::EmergencyResource,
        haven_core::crisis::HumanHandoff,
        haven_core::crisis::HandoffStatus,
        haven_core::crisis::FlagSessionRequest,
        routes::quota::EffectivePolicyResponse,
        routes::crisis::AcknowledgeHandoffResponse,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Sweep cadences for the two background reconcilers.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REDACTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Quota day windows run in a fixed reference timezone, never UTC or the
    // caller's local time
    let reference_tz: Tz = match std::env::var("HAVEN_REFERENCE_TZ") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(tz = %raw, "unknown HAVEN_REFERENCE_TZ; using default");
            haven_core::policy::DEFAULT_REFERENCE_TZ
                .parse()
                .expect("default reference timezone is valid")
        }),
        Err(_) => haven_core::policy::DEFAULT_REFERENCE_TZ
            .parse()
            .expect("default reference timezone is valid"),
    };

    let redaction_url =
        std::env::var("REDACTION_API_URL").expect("REDACTION_API_URL must be set");
    let redaction_key = std::env::var("REDACTION_API_KEY").unwrap_or_default();
    let redaction = Arc::new(HttpRedactionClient::new(redaction_url, redaction_key));

    let provider: Arc<dyn ConversationProvider> = match std::env::var("PROVIDER_API_URL") {
        Ok(url) => {
            let key = std::env::var("PROVIDER_API_KEY").unwrap_or_default();
            Arc::new(HttpConversationProvider::new(url, key))
        }
        Err(_) => {
            tracing::warn!("PROVIDER_API_URL not set; AI guidance injection disabled");
            Arc::new(DisabledConversationProvider)
        }
    };

    let app_state = state::AppState {
        db: pool.clone(),
        bus: EventBus::new(),
        scheduler: TerminationScheduler::new(),
        quota: QuotaEnforcer::new(reference_tz),
        redaction: redaction.clone(),
        provider,
    };

    // Expired-session reconciliation: the first tick runs immediately and
    // picks up sessions whose in-memory timers were lost to a restart
    {
        let db = pool.clone();
        let bus = app_state.bus.clone();
        let scheduler = app_state.scheduler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match registry::sweep_expired_sessions(&db, &bus, &scheduler).await {
                    Ok(0) => {}
                    Ok(ended) => tracing::info!(ended, "expiry sweep ended overdue sessions"),
                    Err(err) => tracing::warn!(error = ?err, "expiry sweep failed"),
                }
            }
        });
    }

    // Redaction retry: completes messages persisted while the gateway was down
    {
        let db = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REDACTION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match redaction::retry_pending_redactions(&db, redaction.as_ref()).await {
                    Ok(0) => {}
                    Ok(completed) => {
                        tracing::info!(completed, "redaction sweep completed pending messages");
                    }
                    Err(err) => tracing::warn!(error = ?err, "redaction sweep failed"),
                }
            }
        });
    }

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-group rate limiting
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::sessions::write_router().layer(middleware::rate_limit::sessions_write_layer()))
        .merge(routes::sessions::read_router().layer(middleware::rate_limit::reads_layer()))
        .merge(routes::messages::write_router().layer(middleware::rate_limit::messages_write_layer()))
        .merge(routes::messages::read_router().layer(middleware::rate_limit::reads_layer()))
        .merge(routes::quota::router().layer(middleware::rate_limit::reads_layer()))
        .merge(routes::crisis::router().layer(middleware::rate_limit::reads_layer()))
        .merge(routes::realtime::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Haven API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
