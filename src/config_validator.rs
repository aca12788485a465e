use crate::error::EntitlementError;
use crate::validation::validate_tier_names;

/// Validates configuration values at startup
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), EntitlementError> {
        if url.is_empty() {
            return Err(EntitlementError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(EntitlementError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates cache staleness window and fetch timeout
    pub fn validate_cache(ttl_secs: u64, fetch_timeout_ms: u64) -> Result<(), EntitlementError> {
        if ttl_secs > 3600 {
            return Err(EntitlementError::Validation(
                "Cache TTL must not exceed one hour".to_string(),
            ));
        }

        if fetch_timeout_ms == 0 {
            return Err(EntitlementError::Validation(
                "Fetch timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the subscription tier catalogue
    pub fn validate_tiers(tiers: &[String]) -> Result<(), EntitlementError> {
        validate_tier_names(tiers).map_err(|err| {
            EntitlementError::Validation(
                err.message
                    .map(|m| m.into_owned())
                    .unwrap_or_else(|| "invalid subscription tier".to_string()),
            )
        })
    }

    pub fn validate_log_level(level: &str) -> Result<(), EntitlementError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(EntitlementError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid_levels
            )));
        }

        Ok(())
    }
}
