use crate::admin::AdminService;
use crate::backend::RegistryBackend;
use crate::cache::FeatureCache;
use crate::config::Settings;
use crate::evaluator::Entitlements;
use crate::handlers::{
    clear_company_override, company_features, create_feature, delete_company, delete_feature,
    evaluate_batch, evaluate_feature, get_feature, health_check, list_features, patch_feature,
    put_feature, readiness_check, set_rollout, toggle_feature, upsert_company_overrides, AppState,
    SharedState,
};
use crate::health::HealthChecker;
use crate::middleware::logging_middleware;
use crate::overrides::OverrideStore;
use crate::registry::FeatureRegistry;
use axum::routing::{delete, get, patch, post, put};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

impl AppState {
    /// Wire registry, override store, cache, evaluator and admin API over one backend.
    pub fn new(backend: Arc<dyn RegistryBackend>, settings: &Settings) -> SharedState {
        let registry = Arc::new(
            FeatureRegistry::new(Arc::clone(&backend))
                .with_tier_catalogue(settings.subscription_tiers.iter().cloned()),
        );
        let overrides = Arc::new(OverrideStore::new(Arc::clone(&registry)));
        let cache = Arc::new(FeatureCache::new(settings.cache_ttl));

        Arc::new(AppState {
            entitlements: Entitlements::new(
                Arc::clone(&registry),
                Arc::clone(&cache),
                settings.fetch_timeout,
            ),
            admin: AdminService::new(registry, overrides, Arc::clone(&cache)),
            health: HealthChecker::new(backend, cache, settings.fetch_timeout),
        })
    }
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Read endpoints
        .route("/features", get(list_features))
        .route("/features/:key", get(get_feature))
        .route("/features/:key/evaluate", get(evaluate_feature))
        .route("/evaluate", post(evaluate_batch))
        .route("/companies/:company_id/features", get(company_features))
        // Admin endpoints
        .route("/admin/features", post(create_feature))
        .route(
            "/admin/features/:key",
            put(put_feature).patch(patch_feature).delete(delete_feature),
        )
        .route("/admin/features/:key/rollout", patch(set_rollout))
        .route("/admin/features/:key/toggle", patch(toggle_feature))
        .route("/admin/companies/:company_id", delete(delete_company))
        .route(
            "/admin/companies/:company_id/features",
            put(upsert_company_overrides),
        )
        .route(
            "/admin/companies/:company_id/features/:key",
            delete(clear_company_override),
        )
        // Health and readiness endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(state: SharedState, bind_addr: SocketAddr) -> Self {
        Self {
            app: create_app(state),
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Entitlements server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
