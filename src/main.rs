use anyhow::{Context, Result};
use entitlements::backend::{MemoryBackend, RedisBackend, RegistryBackend};
use entitlements::config::Config;
use entitlements::feature::FeatureSpec;
use entitlements::handlers::AppState;
use entitlements::server::Server;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_seed_file(path: &Path) -> Result<Vec<FeatureSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse seed file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration from arguments and environment
    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("entitlements={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing::info!("Starting entitlements service");
    tracing::info!(
        "Configuration: bind_addr={}, backend={}, cache_ttl_secs={}, fetch_timeout_ms={}",
        config.bind_addr,
        if config.redis_url.is_some() { "redis" } else { "memory" },
        config.cache_ttl_secs,
        config.fetch_timeout_ms
    );

    let backend: Arc<dyn RegistryBackend> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBackend::connect(url, &config.redis_key_prefix)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect registry: {}", e))?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory registry");
            Arc::new(MemoryBackend::new())
        }
    };

    let state = AppState::new(backend, &config.settings());

    if let Some(path) = &config.seed_file {
        let specs = load_seed_file(path)?;
        state
            .admin
            .seed(specs)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to seed features: {}", e))?;
    }

    Server::new(state, config.bind_addr)
        .run()
        .await
        .context("Server error")?;

    Ok(())
}
