use crate::config_validator::ConfigValidator;
use crate::error::EntitlementError;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "entitlements", version, about = "Feature entitlement and rollout service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; the in-memory registry is used when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key written by the registry
    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = "entitlements")]
    pub redis_key_prefix: String,

    /// How long cached features and overrides are served before a refetch
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 30)]
    pub cache_ttl_secs: u64,

    /// Upper bound on a registry fetch during evaluation
    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value_t = 250)]
    pub fetch_timeout_ms: u64,

    /// Known subscription tiers, comma separated; empty accepts any tier
    #[arg(
        long,
        env = "SUBSCRIPTION_TIERS",
        value_delimiter = ',',
        default_value = "free,starter,pro,enterprise"
    )]
    pub subscription_tiers: Vec<String>,

    /// JSON file with feature specs created at startup when missing
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Runtime settings of the service core, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub subscription_tiers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            fetch_timeout: Duration::from_millis(250),
            subscription_tiers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from command line arguments and environment variables
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn validate(&self) -> Result<(), EntitlementError> {
        if let Some(url) = &self.redis_url {
            ConfigValidator::validate_redis_url(url)?;
        }
        ConfigValidator::validate_cache(self.cache_ttl_secs, self.fetch_timeout_ms)?;
        ConfigValidator::validate_tiers(&self.tiers())?;
        ConfigValidator::validate_log_level(&self.log_level)?;
        Ok(())
    }

    fn tiers(&self) -> Vec<String> {
        self.subscription_tiers
            .iter()
            .map(|tier| tier.trim().to_string())
            .filter(|tier| !tier.is_empty())
            .collect()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            subscription_tiers: self.tiers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["entitlements"]).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        let settings = config.settings();
        assert_eq!(settings.cache_ttl, Duration::from_secs(30));
        assert_eq!(
            settings.subscription_tiers,
            ["free", "starter", "pro", "enterprise"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_tier_catalogue() {
        let config =
            Config::try_parse_from(["entitlements", "--subscription-tiers", ""]).unwrap();
        assert!(config.settings().subscription_tiers.is_empty());
    }

    #[test]
    fn test_invalid_redis_url_rejected() {
        let config =
            Config::try_parse_from(["entitlements", "--redis-url", "http://localhost"]).unwrap();
        assert!(config.validate().is_err());
    }
}
