use crate::config::{ChatConfig, ProviderKind, StoreBackend};
use crate::handlers;
use crate::services::providers::{
    ChatProvider, MockChatProvider, PerplexityConfig, PerplexityProvider,
};
use crate::services::{InMemorySessionStore, MongoSessionStore, SessionStore};
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ChatConfig,
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn ChatProvider>,
}

type Server = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

pub struct Application {
    port: u16,
    server: Server,
    state: AppState,
}

/// Build the session store selected by configuration.
pub async fn build_store(config: &ChatConfig) -> Result<Arc<dyn SessionStore>, AppError> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store; sessions are lost on restart");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
        StoreBackend::Mongo => {
            let uri = config.mongodb.uri.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("MONGODB_URI is required but not set"))
            })?;
            let store = MongoSessionStore::connect(uri, &config.mongodb.database).await?;
            store.initialize_indexes().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the LLM provider selected by configuration.
pub fn build_provider(config: &ChatConfig) -> Result<Arc<dyn ChatProvider>, AppError> {
    match config.provider.kind {
        ProviderKind::Mock => Ok(Arc::new(MockChatProvider::new())),
        ProviderKind::Perplexity => {
            let provider = PerplexityProvider::new(PerplexityConfig {
                base_url: config.provider.base_url.clone(),
                model: config.provider.model.clone(),
                system_prompt: config.provider.system_prompt.clone(),
                request_timeout: Duration::from_secs(config.provider.request_timeout_secs),
            })
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e.to_string())))?;
            Ok(Arc::new(provider))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/chat/stream", post(handlers::stream_chat))
        .route("/chat/history", get(handlers::history))
        .route(
            "/chat/session/:id",
            patch(handlers::rename_session).delete(handlers::delete_session),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

impl Application {
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let store = build_store(&config).await.map_err(|e| {
            tracing::error!("Failed to initialize session store: {}", e);
            e
        })?;
        let provider = build_provider(&config)?;

        Self::with_components(config, store, provider).await
    }

    /// Build with an explicit store and provider.
    pub async fn with_components(
        config: ChatConfig,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, AppError> {
        let state = AppState {
            config: config.clone(),
            store,
            provider,
        };

        let app = router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::pin(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.state.store.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
