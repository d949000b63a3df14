//! Lagoon - federation engine for a federated social-networking server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox, actor and note documents                          │
//! │  - Health and metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Federation / Service Layer                   │
//! │  - Signature verification and activity dispatch             │
//! │  - Local/remote reference resolution                        │
//! │  - Outbound delivery queue                                  │
//! │  - Accounts, notes and threads                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Local mutations and thread assembly
//! - `federation`: Inbound and outbound federation
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Largest inbox body accepted
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Local instance identity and federation policy
    pub ctx: Arc<federation::FederationContext>,

    /// HTTP client for federation
    pub http_client: reqwest::Client,

    pub resolver: federation::LocalReferenceResolver,
    pub verifier: Arc<federation::SignatureVerifier>,
    pub dispatcher: Arc<federation::ActivityDispatcher>,
    pub outbound: Arc<federation::OutboundFederator>,

    pub accounts: Arc<service::AccountService>,
    pub notes: Arc<service::NoteService>,
    pub threads: Arc<service::ThreadService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client
    /// 3. Wire federation components and services
    /// 4. Ensure configured local accounts exist
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Lagoon/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 3. Federation components
        let ctx = Arc::new(federation::FederationContext::from_config(&config)?);
        let remote = Arc::new(federation::RemoteResolver::new(
            ctx.clone(),
            db.clone(),
            http_client.clone(),
            Arc::new(federation::NoopSearchIndex),
        ));
        let resolver = federation::LocalReferenceResolver::new(
            federation::LocalIndex::new(ctx.clone(), db.clone()),
            remote,
        );
        let outbound = Arc::new(federation::OutboundFederator::new(
            ctx.clone(),
            db.clone(),
            http_client.clone(),
        ));
        let verifier = Arc::new(federation::SignatureVerifier::new(
            ctx.clone(),
            resolver.clone(),
        ));
        let dispatcher = Arc::new(federation::ActivityDispatcher::new(
            ctx.clone(),
            db.clone(),
            resolver.clone(),
            outbound.clone(),
        ));

        let accounts = Arc::new(service::AccountService::new(
            ctx.clone(),
            db.clone(),
            outbound.clone(),
        ));
        let notes = Arc::new(service::NoteService::new(
            db.clone(),
            resolver.clone(),
            outbound.clone(),
        ));
        let threads = Arc::new(service::ThreadService::new(db.clone()));

        // 4. Local accounts
        Self::ensure_accounts(&db, &accounts, &config).await?;

        tracing::info!(base_url = %ctx.base_url(), "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            ctx,
            http_client,
            resolver,
            verifier,
            dispatcher,
            outbound,
            accounts,
            notes,
            threads,
        })
    }

    /// Create configured local accounts that do not exist yet
    ///
    /// Existing accounts keep their keys; display name and lock state are
    /// brought in line with configuration.
    async fn ensure_accounts(
        db: &data::Database,
        accounts: &service::AccountService,
        config: &config::AppConfig,
    ) -> Result<(), error::AppError> {
        for account in &config.accounts {
            match db.get_local_actor_by_username(&account.username).await? {
                Some(actor) => {
                    let update = service::ProfileUpdate {
                        display_name: Some(account.display_name.clone().unwrap_or_default()),
                        locked: Some(account.locked),
                        ..Default::default()
                    };
                    let (actor, batch) = accounts.update_profile(&actor.id, update).await?;
                    tracing::info!(
                        username = %actor.username,
                        deliveries = batch.len(),
                        "Local account exists"
                    );
                }
                None => {
                    let actor = accounts
                        .create_local_actor(
                            &account.username,
                            account.display_name.clone(),
                            account.locked,
                        )
                        .await?;
                    tracing::info!(
                        username = %actor.username,
                        actor_id = %actor.id,
                        "Local account created"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
