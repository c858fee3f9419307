use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use secrecy::SecretString;
use tower_http::trace::TraceLayer;

use crate::config_parser::{Config, ProviderKind, StoreBackend};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::gatekeeper::AccessGatekeeper;
use crate::inference::{ChatProvider, EchoProvider, OpenAiCompatProvider};
use crate::mailer::{LogMailer, VerificationMailer};
use crate::sessions::{require_session, SessionKeys};
use crate::store::{CreateUserParams, MemoryUserStore, RedisUserStore, UserStore};
use crate::usage::UsageTracker;
use crate::verification::VerificationGate;

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub store: Arc<dyn UserStore>,
    pub gatekeeper: Arc<AccessGatekeeper>,
    pub verification_gate: Arc<VerificationGate>,
    pub tracker: Arc<UsageTracker>,
    pub provider: Arc<dyn ChatProvider>,
    pub mailer: Arc<dyn VerificationMailer>,
    pub sessions: SessionKeys,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Config) -> Result<Self, Error> {
        let store = setup_store(&config).await?;
        let provider = setup_provider(&config)?;
        Ok(Self::with_parts(config, store, provider, Arc::new(LogMailer)))
    }

    /// Assemble state from prebuilt parts. Tests use this to swap in their
    /// own store, provider, or mailer.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn UserStore>,
        provider: Arc<dyn ChatProvider>,
        mailer: Arc<dyn VerificationMailer>,
    ) -> Self {
        let sessions = SessionKeys::new(&config.sessions);
        Self {
            config: Arc::new(config),
            gatekeeper: Arc::new(AccessGatekeeper::new(store.clone())),
            verification_gate: Arc::new(VerificationGate::new(store.clone())),
            tracker: Arc::new(UsageTracker::new(store.clone())),
            store,
            provider,
            mailer,
            sessions,
        }
    }
}

async fn setup_store(config: &Config) -> Result<Arc<dyn UserStore>, Error> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = MemoryUserStore::new();
            let now = Utc::now();
            for seed in &config.store.users {
                let mut params = CreateUserParams::new(seed.email.clone())
                    .with_id(seed.id.clone())
                    .with_plan(seed.plan);
                if let Some(name) = &seed.name {
                    params = params.with_name(name.clone());
                }
                store.create_user(params, now).await?;
            }
            tracing::info!(
                seeded_users = config.store.users.len(),
                "Using in-memory user store"
            );
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => {
            if !config.store.users.is_empty() {
                tracing::warn!("`store.users` is ignored with the redis backend");
            }
            let url = config.redis_url().ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "Redis backend selected but no URL configured".to_string(),
                })
            })?;
            Ok(Arc::new(RedisUserStore::new(&url).await?))
        }
    }
}

fn setup_provider(config: &Config) -> Result<Arc<dyn ChatProvider>, Error> {
    match config.provider.kind {
        ProviderKind::Echo => {
            tracing::info!("Using echo model provider");
            Ok(Arc::new(EchoProvider))
        }
        ProviderKind::OpenaiCompatible => {
            let base_url = config.provider.base_url.clone().ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "`provider.base_url` is required".to_string(),
                })
            })?;
            let model = config.provider.model.clone().ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "`provider.model` is required".to_string(),
                })
            })?;
            let api_key = match &config.provider.api_key_env {
                None => None,
                Some(var) => Some(SecretString::from(std::env::var(var).map_err(|_| {
                    Error::new(ErrorDetails::Config {
                        message: format!(
                            "Provider API key environment variable `{var}` is not set"
                        ),
                    })
                })?)),
            };
            tracing::info!(base_url = %base_url, model, "Using OpenAI-compatible model provider");
            Ok(Arc::new(OpenAiCompatProvider::new(
                reqwest::Client::new(),
                base_url,
                model,
                api_key,
            )))
        }
    }
}

/// Build the full gateway router. User-scoped routes sit behind the session
/// middleware; `/health` and `/status` stay open for probes.
pub fn build_router(app_state: AppStateData) -> Router {
    let user_routes = Router::new()
        .route("/v1/chat", post(endpoints::chat::chat_handler))
        .route(
            "/v1/verification/request",
            post(endpoints::verification::request_code_handler),
        )
        .route(
            "/v1/verification/confirm",
            post(endpoints::verification::confirm_code_handler),
        )
        .route("/v1/usage", get(endpoints::usage::usage_handler))
        .layer(middleware::from_fn_with_state(
            app_state.sessions.clone(),
            require_session,
        ));

    Router::new()
        .merge(user_routes)
        .route("/health", get(endpoints::status::health_handler))
        .route("/status", get(endpoints::status::status_handler))
        .fallback(endpoints::fallback::handle_404)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
