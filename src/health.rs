use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::backend::RegistryBackend;
use crate::error::EntitlementError;
use crate::cache::FeatureCache;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub cached_features: usize,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub registry: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    backend: Arc<dyn RegistryBackend>,
    cache: Arc<FeatureCache>,
    ping_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        cache: Arc<FeatureCache>,
        ping_timeout: Duration,
    ) -> Self {
        // Anchor uptime at service construction.
        std::sync::LazyLock::force(&START_TIME);
        Self {
            backend,
            cache,
            ping_timeout,
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let registry = self.check_registry().await;

        // Cached entries keep serving while the registry is down.
        let overall_status = if registry.is_healthy() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            cached_features: self.cache.features.len(),
            dependencies: DependencyStatus { registry },
        }
    }

    pub async fn check_registry(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = tokio::time::timeout(self.ping_timeout, self.backend.ping())
            .await
            .unwrap_or_else(|_| {
                Err(EntitlementError::RegistryUnavailable(format!(
                    "ping exceeded {}ms",
                    self.ping_timeout.as_millis()
                )))
            });
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                backend: self.backend.name().to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(err) => ServiceStatus {
                backend: self.backend.name().to_string(),
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(err.to_string()),
            },
        }
    }
}
