//! CreatorSync - Instagram Graph API synchronization for creator accounts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Webhook handshake and deliveries                          │
//! │  - OAuth, account, sync, conversation, lookup endpoints      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Paginated sync, dedupe, webhook ingestion                 │
//! │  - Conversation projection, profile pictures, quota          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │         Data Layer            │ │    Instagram Graph API      │
//! │  - SQLite (sqlx)              │ │  - retrying transport       │
//! │  - in-memory TTL caches       │ │  - token lifecycle          │
//! └──────────────────────────────┘ └────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `auth`: sessions and Instagram OAuth
//! - `instagram`: Graph API client, error classification, webhooks
//! - `service`: business logic layer
//! - `data`: database and cache layer
//! - `tasks`: supervised background work
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod instagram;
pub mod metrics;
pub mod service;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use instagram::{GraphTransport, Sleeper};

/// Application state shared across all handlers
///
/// Cloned per request; everything inside is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Graph API endpoints behind the retrying client
    pub graph: Arc<instagram::GraphApi>,

    /// OAuth exchange, refresh and validation
    pub tokens: Arc<instagram::TokenLifecycleManager>,

    /// Token validation verdicts (volatile)
    pub token_cache: Arc<data::TokenValidationCache>,

    /// Started OAuth flows (volatile, single use)
    pub oauth_states: Arc<auth::OAuthStateStore>,

    /// Webhook HMAC verification
    pub verifier: Arc<instagram::SignatureVerifier>,

    pub ingestor: Arc<service::WebhookIngestor>,

    pub sync: Arc<service::SyncEngine>,

    /// One sync per account at a time
    pub active_syncs: service::ActiveSyncs,

    pub progress: Arc<service::ProgressHub>,

    pub projector: Arc<service::ConversationProjector>,

    pub profile_pictures: Arc<service::ProfilePictureResolver>,

    pub quota: Arc<service::QuotaService>,

    /// Supervised background work, drained on shutdown
    pub tasks: tasks::BackgroundTasks,
}

impl AppState {
    /// Initialize application state with the production Graph transport
    ///
    /// # Steps
    /// 1. Build the HTTP client
    /// 2. Connect to SQLite database and run migrations
    /// 3. Wire caches and services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("CreatorSync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let transport = Arc::new(instagram::ReqwestTransport::new(Arc::new(http_client)));
        Self::with_graph_transport(config, transport, Arc::new(instagram::TokioSleeper)).await
    }

    /// Initialize application state over any Graph transport and clock.
    ///
    /// Integration tests pass scripted doubles here.
    pub async fn with_graph_transport(
        config: config::AppConfig,
        transport: Arc<dyn GraphTransport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let client = instagram::RetryingClient::new(
            transport,
            sleeper.clone(),
            instagram::RetryPolicy::from_config(&config.retry),
        );
        let graph = Arc::new(instagram::GraphApi::new(client, config.instagram.clone()));

        let token_cache = Arc::new(data::TokenValidationCache::new(
            Duration::from_secs(config.cache.token_valid_ttl),
            Duration::from_secs(config.cache.token_invalid_ttl),
            config.cache.max_entries,
        ));
        let tokens = Arc::new(instagram::TokenLifecycleManager::new(
            db.clone(),
            graph.clone(),
            token_cache.clone(),
            config.instagram.require_long_lived_token,
            config.sync.refresh_lookahead_days,
            config.cache.token_invalid_ttl,
        ));

        let tasks = tasks::BackgroundTasks::new();
        let progress = Arc::new(service::ProgressHub::start(&tasks));

        let sync = Arc::new(service::SyncEngine::new(
            db.clone(),
            graph.clone(),
            tokens.clone(),
            sleeper,
            service::SyncSettings::from(&config.sync),
        ));
        let profile_pictures = Arc::new(service::ProfilePictureResolver::new(
            db.clone(),
            graph.clone(),
            tokens.clone(),
            tasks.clone(),
            &config.cache,
            &config.profile_pictures,
        ));
        let quota = Arc::new(service::QuotaService::new(
            db.clone(),
            graph.clone(),
            &config.quota,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            verifier: Arc::new(instagram::SignatureVerifier::new(
                config.instagram.webhook_secrets.clone(),
            )),
            oauth_states: Arc::new(auth::OAuthStateStore::new(config.cache.max_entries)),
            ingestor: Arc::new(service::WebhookIngestor::new(db.clone())),
            projector: Arc::new(service::ConversationProjector::new(db.clone())),
            active_syncs: service::ActiveSyncs::new(),
            config: Arc::new(config),
            db,
            graph,
            tokens,
            token_cache,
            sync,
            progress,
            profile_pictures,
            quota,
            tasks,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower::ServiceBuilder;
    use axum::extract::DefaultBodyLimit;
    use tower_http::trace::TraceLayer;

    /// Webhook batches and API bodies are small JSON documents.
    const MAX_BODY_BYTES: usize = 1024 * 1024;

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::webhook_router())
        .merge(auth::auth_router())
        .merge(api::app_router())
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.public_url.starts_with("https://") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.public_url.trim_end_matches('/');
    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from public URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
